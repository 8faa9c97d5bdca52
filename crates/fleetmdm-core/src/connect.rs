//! Connect/acknowledge message shapes.

use serde::{Deserialize, Serialize};

use crate::codec::strip_nulls;
use crate::error::{Error, Result};

/// Outcome a device reports for its previous command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Idle,
    Acknowledged,
    Error,
    CommandFormatError,
    NotNow,
}

impl Status {
    pub const ALL: &'static [Status] = &[
        Status::Idle,
        Status::Acknowledged,
        Status::Error,
        Status::CommandFormatError,
        Status::NotNow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Idle => "Idle",
            Status::Acknowledged => "Acknowledged",
            Status::Error => "Error",
            Status::CommandFormatError => "CommandFormatError",
            Status::NotNow => "NotNow",
        }
    }

    /// Terminal failure for the in-flight command.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Error | Status::CommandFormatError)
    }

    /// Whether the response reports on a specific command.
    pub fn requires_command_uuid(&self) -> bool {
        !matches!(self, Status::Idle)
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::validation(format!("unknown status {s:?}")))
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the error chain a device attaches to `Error` responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorChainItem {
    #[serde(rename = "ErrorCode")]
    pub error_code: i64,
    #[serde(rename = "ErrorDomain")]
    pub error_domain: String,
    #[serde(rename = "LocalizedDescription")]
    pub localized_description: String,
}

/// A device's connect request: the outcome of its last command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "UserID", default)]
    pub user_id: Option<String>,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "CommandUUID", default)]
    pub command_uuid: Option<String>,
    #[serde(rename = "RequestType", default)]
    pub request_type: Option<String>,
    #[serde(rename = "ErrorChain", default)]
    pub error_chain: Vec<ErrorChainItem>,
}

impl ConnectResponse {
    /// An `Idle` response for `udid`.
    pub fn idle(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            user_id: None,
            status: Status::Idle,
            command_uuid: None,
            request_type: None,
            error_chain: Vec::new(),
        }
    }

    /// A response reporting `status` for the command `command_uuid`.
    pub fn with_status(
        udid: impl Into<String>,
        status: Status,
        command_uuid: impl Into<String>,
    ) -> Self {
        Self {
            status,
            command_uuid: Some(command_uuid.into()),
            ..Self::idle(udid)
        }
    }

    pub fn is_user_scoped(&self) -> bool {
        self.user_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Structural checks that do not need the queue.
    pub fn validate(&self) -> Result<()> {
        if self.udid.is_empty() {
            return Err(Error::validation("connect response has an empty UDID"));
        }
        if self.status.requires_command_uuid()
            && self.command_uuid.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::validation(format!(
                "{} response without CommandUUID",
                self.status
            )));
        }
        Ok(())
    }

    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let serde_json::Value::Object(mut map) = serde_json::to_value(self)? else {
            return Err(Error::Internal("connect response did not encode to an object".into()));
        };
        strip_nulls(&mut map);
        Ok(serde_json::to_vec(&map)?)
    }
}

/// Decode a device-facing connect body.
///
/// An unrecognised `Status` is a validation error rather than a
/// serialization error so the caller can answer it as a client fault.
pub fn decode_connect(body: &[u8]) -> Result<ConnectResponse> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    match value.get("Status").and_then(|v| v.as_str()) {
        Some(status) => {
            status.parse::<Status>()?;
        }
        None => return Err(Error::validation("connect response is missing Status")),
    }
    let response: ConnectResponse = serde_json::from_value(value)?;
    response.validate()?;
    Ok(response)
}
