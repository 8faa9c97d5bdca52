//! Check-in message shapes.
//!
//! Devices check in with a JSON body discriminated by `MessageType`. Only the
//! device-level messages are modelled; user-scoped authentication is rejected
//! with a typed error so the transport can still answer per protocol.

use serde::{Deserialize, Serialize};

use crate::codec::{base64_bytes, strip_nulls};
use crate::error::{Error, Result};
use crate::event::topics;

/// Device identity report sent on enrollment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authenticate {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "OSVersion")]
    pub os_version: String,
    #[serde(rename = "BuildVersion")]
    pub build_version: String,
    #[serde(rename = "ProductName")]
    pub product_name: String,
    #[serde(rename = "Model")]
    pub model: String,
    #[serde(rename = "DeviceName")]
    pub device_name: String,
    #[serde(rename = "IMEI")]
    pub imei: String,
    #[serde(rename = "MEID")]
    pub meid: String,
}

/// Push credential registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUpdate {
    #[serde(rename = "UDID")]
    pub udid: String,
    /// Set for user-channel token updates, which the device store ignores.
    #[serde(rename = "UserID")]
    pub user_id: Option<String>,
    #[serde(rename = "Topic")]
    pub topic: String,
    #[serde(rename = "Token", with = "base64_bytes")]
    pub token: Vec<u8>,
    #[serde(rename = "PushMagic")]
    pub push_magic: String,
    #[serde(rename = "UnlockToken", with = "base64_bytes")]
    pub unlock_token: Vec<u8>,
    #[serde(rename = "AwaitingConfiguration")]
    pub awaiting_configuration: bool,
}

impl TokenUpdate {
    /// Whether this update belongs to a user channel rather than the device.
    pub fn is_user_scoped(&self) -> bool {
        self.user_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Device un-enrollment notice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckOut {
    #[serde(rename = "UDID")]
    pub udid: String,
    #[serde(rename = "Topic")]
    pub topic: String,
}

/// A device-level check-in message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckinMessage {
    Authenticate(Authenticate),
    TokenUpdate(TokenUpdate),
    CheckOut(CheckOut),
}

impl CheckinMessage {
    pub fn udid(&self) -> &str {
        match self {
            Self::Authenticate(m) => &m.udid,
            Self::TokenUpdate(m) => &m.udid,
            Self::CheckOut(m) => &m.udid,
        }
    }

    /// Protocol `MessageType` value.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => "Authenticate",
            Self::TokenUpdate(_) => "TokenUpdate",
            Self::CheckOut(_) => "CheckOut",
        }
    }

    /// Bus topic for this message type.
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Authenticate(_) => topics::AUTHENTICATE,
            Self::TokenUpdate(_) => topics::TOKEN_UPDATE,
            Self::CheckOut(_) => topics::CHECK_OUT,
        }
    }

    /// Encode as a device-facing JSON body.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let value = match self {
            Self::Authenticate(m) => serde_json::to_value(m)?,
            Self::TokenUpdate(m) => serde_json::to_value(m)?,
            Self::CheckOut(m) => serde_json::to_value(m)?,
        };
        let serde_json::Value::Object(mut map) = value else {
            return Err(Error::Internal("check-in did not encode to an object".into()));
        };
        strip_nulls(&mut map);
        map.insert(
            "MessageType".to_string(),
            serde_json::Value::String(self.message_type().to_string()),
        );
        Ok(serde_json::to_vec(&map)?)
    }
}

/// Decode a device-facing check-in body.
///
/// `UserAuthenticate` yields [`Error::ProtocolReject`]; any other unknown
/// `MessageType` yields [`Error::UnknownMessageType`].
pub fn decode_checkin(body: &[u8]) -> Result<CheckinMessage> {
    let value: serde_json::Value = serde_json::from_slice(body)?;
    let message_type = value
        .get("MessageType")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::validation("check-in is missing MessageType"))?
        .to_string();

    let message = match message_type.as_str() {
        "Authenticate" => CheckinMessage::Authenticate(serde_json::from_value(value)?),
        "TokenUpdate" => CheckinMessage::TokenUpdate(serde_json::from_value(value)?),
        "CheckOut" => CheckinMessage::CheckOut(serde_json::from_value(value)?),
        "UserAuthenticate" => {
            return Err(Error::protocol_reject(
                "per-user authentication is not supported",
            ))
        }
        other => return Err(Error::UnknownMessageType(other.to_string())),
    };

    if message.udid().is_empty() {
        return Err(Error::validation(format!(
            "{} check-in has an empty UDID",
            message.message_type()
        )));
    }
    Ok(message)
}
