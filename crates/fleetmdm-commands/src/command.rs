//! Command data structures.
//!
//! Each command kind is a variant of [`CommandPayload`] with its own field
//! struct. The same serde derives serve both encodings: bincode on the bus,
//! protocol JSON towards the device.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use fleetmdm_core::codec::{base64_bytes, strip_nulls};
use fleetmdm_core::{validation_err, Error, Result};

/// Unique command identifier.
pub type CommandId = String;

/// Query device attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInformation {
    #[serde(rename = "Queries")]
    pub queries: Vec<String>,
}

/// Install a configuration profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallProfile {
    /// Signed or unsigned profile bytes.
    #[serde(rename = "Payload", with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveProfile {
    #[serde(rename = "Identifier")]
    pub identifier: String,
}

/// Install an app from the store or a manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallApplication {
    #[serde(rename = "ManifestURL")]
    pub manifest_url: Option<String>,
    #[serde(rename = "iTunesStoreID")]
    pub itunes_store_id: Option<i64>,
    #[serde(rename = "Identifier")]
    pub identifier: Option<String>,
    #[serde(rename = "ManagementFlags")]
    pub management_flags: Option<i64>,
    #[serde(rename = "NotManaged")]
    pub not_managed: Option<bool>,
    #[serde(rename = "ChangeManagementState")]
    pub change_management_state: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstalledApplicationList {
    #[serde(rename = "Identifiers")]
    pub identifiers: Vec<String>,
    #[serde(rename = "ManagedAppsOnly")]
    pub managed_apps_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceLock {
    #[serde(rename = "PIN")]
    pub pin: Option<String>,
    #[serde(rename = "Message")]
    pub message: Option<String>,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EraseDevice {
    #[serde(rename = "PIN")]
    pub pin: Option<String>,
}

/// A typed command payload, one variant per `RequestType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandPayload {
    DeviceInformation(DeviceInformation),
    InstallProfile(InstallProfile),
    RemoveProfile(RemoveProfile),
    ProfileList,
    InstallApplication(InstallApplication),
    InstalledApplicationList(InstalledApplicationList),
    SecurityInfo,
    DeviceLock(DeviceLock),
    EraseDevice(EraseDevice),
    RestartDevice,
    ShutDownDevice,
}

impl CommandPayload {
    /// Every `RequestType` this crate can encode and decode.
    pub const REQUEST_TYPES: &'static [&'static str] = &[
        "DeviceInformation",
        "InstallProfile",
        "RemoveProfile",
        "ProfileList",
        "InstallApplication",
        "InstalledApplicationList",
        "SecurityInfo",
        "DeviceLock",
        "EraseDevice",
        "RestartDevice",
        "ShutDownDevice",
    ];

    /// Protocol `RequestType` tag.
    pub fn request_type(&self) -> &'static str {
        match self {
            Self::DeviceInformation(_) => "DeviceInformation",
            Self::InstallProfile(_) => "InstallProfile",
            Self::RemoveProfile(_) => "RemoveProfile",
            Self::ProfileList => "ProfileList",
            Self::InstallApplication(_) => "InstallApplication",
            Self::InstalledApplicationList(_) => "InstalledApplicationList",
            Self::SecurityInfo => "SecurityInfo",
            Self::DeviceLock(_) => "DeviceLock",
            Self::EraseDevice(_) => "EraseDevice",
            Self::RestartDevice => "RestartDevice",
            Self::ShutDownDevice => "ShutDownDevice",
        }
    }

    /// Reject payloads a device would answer with CommandFormatError.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::InstallProfile(c) if c.payload.is_empty() => {
                Err(validation_err!("InstallProfile requires a Payload"))
            }
            Self::RemoveProfile(c) if c.identifier.is_empty() => {
                Err(validation_err!("RemoveProfile requires an Identifier"))
            }
            Self::InstallApplication(c)
                if c.manifest_url.is_none()
                    && c.itunes_store_id.is_none()
                    && c.identifier.is_none() =>
            {
                Err(validation_err!(
                    "InstallApplication requires ManifestURL, iTunesStoreID or Identifier"
                ))
            }
            _ => Ok(()),
        }
    }

    /// Protocol fields for this kind, without `RequestType`.
    fn wire_fields(&self) -> Result<Map<String, Value>> {
        let value = match self {
            Self::DeviceInformation(c) => serde_json::to_value(c)?,
            Self::InstallProfile(c) => serde_json::to_value(c)?,
            Self::RemoveProfile(c) => serde_json::to_value(c)?,
            Self::InstallApplication(c) => serde_json::to_value(c)?,
            Self::InstalledApplicationList(c) => serde_json::to_value(c)?,
            Self::DeviceLock(c) => serde_json::to_value(c)?,
            Self::EraseDevice(c) => serde_json::to_value(c)?,
            Self::ProfileList | Self::SecurityInfo | Self::RestartDevice | Self::ShutDownDevice => {
                return Ok(Map::new())
            }
        };
        match value {
            Value::Object(mut map) => {
                strip_nulls(&mut map);
                Ok(map)
            }
            _ => Err(Error::Internal(format!(
                "{} fields did not encode to an object",
                self.request_type()
            ))),
        }
    }

    /// Inverse of [`Self::wire_fields`] for the given `RequestType`.
    fn from_wire_fields(request_type: &str, fields: Value) -> Result<Self> {
        Ok(match request_type {
            "DeviceInformation" => Self::DeviceInformation(serde_json::from_value(fields)?),
            "InstallProfile" => Self::InstallProfile(serde_json::from_value(fields)?),
            "RemoveProfile" => Self::RemoveProfile(serde_json::from_value(fields)?),
            "ProfileList" => Self::ProfileList,
            "InstallApplication" => Self::InstallApplication(serde_json::from_value(fields)?),
            "InstalledApplicationList" => {
                Self::InstalledApplicationList(serde_json::from_value(fields)?)
            }
            "SecurityInfo" => Self::SecurityInfo,
            "DeviceLock" => Self::DeviceLock(serde_json::from_value(fields)?),
            "EraseDevice" => Self::EraseDevice(serde_json::from_value(fields)?),
            "RestartDevice" => Self::RestartDevice,
            "ShutDownDevice" => Self::ShutDownDevice,
            other => return Err(validation_err!("unknown RequestType {:?}", other)),
        })
    }
}

/// A command addressed to no device in particular; the queue key carries
/// the UDID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub uuid: CommandId,
    pub payload: CommandPayload,
}

impl Command {
    /// Wrap `payload` with a fresh v4 UUID.
    pub fn new(payload: CommandPayload) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            payload,
        }
    }

    pub fn request_type(&self) -> &'static str {
        self.payload.request_type()
    }

    /// Device-facing body:
    /// `{"CommandUUID": ..., "Command": {"RequestType": ..., ...fields}}`.
    pub fn to_wire(&self) -> Result<Vec<u8>> {
        let mut command = self.payload.wire_fields()?;
        command.insert(
            "RequestType".to_string(),
            Value::String(self.request_type().to_string()),
        );

        let mut body = Map::new();
        body.insert("CommandUUID".to_string(), Value::String(self.uuid.clone()));
        body.insert("Command".to_string(), Value::Object(command));
        Ok(serde_json::to_vec(&body)?)
    }

    /// Decode a device-facing body produced by [`Self::to_wire`].
    pub fn decode_wire(body: &[u8]) -> Result<Self> {
        let Value::Object(mut body) = serde_json::from_slice::<Value>(body)? else {
            return Err(validation_err!("command body is not an object"));
        };
        let uuid = match body.remove("CommandUUID") {
            Some(Value::String(uuid)) if !uuid.is_empty() => uuid,
            _ => return Err(validation_err!("command body is missing CommandUUID")),
        };
        let Some(Value::Object(mut command)) = body.remove("Command") else {
            return Err(validation_err!("command body is missing Command"));
        };
        let request_type = match command.remove("RequestType") {
            Some(Value::String(request_type)) => request_type,
            _ => return Err(validation_err!("command is missing RequestType")),
        };
        let payload = CommandPayload::from_wire_fields(&request_type, Value::Object(command))?;
        Ok(Self { uuid, payload })
    }
}

/// Request to create a command for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub udid: String,
    pub payload: CommandPayload,
}

impl CommandRequest {
    pub fn new(udid: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            udid: udid.into(),
            payload,
        }
    }
}
