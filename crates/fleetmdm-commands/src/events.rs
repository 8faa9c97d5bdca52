//! Command creation events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetmdm_core::event::new_event_id;

use crate::command::Command;

/// Published on `mdm.Command` when a command is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub id: String,
    pub time: DateTime<Utc>,
    /// Target device.
    pub udid: String,
    pub command: Command,
}

impl CommandEvent {
    pub fn new(udid: impl Into<String>, command: Command) -> Self {
        Self {
            id: new_event_id(),
            time: Utc::now(),
            udid: udid.into(),
            command,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandPayload, InstallApplication, InstallProfile};
    use fleetmdm_core::event::{decode, encode};

    #[test]
    fn test_command_event_reencodes_identically() {
        let payloads = vec![
            CommandPayload::InstallProfile(InstallProfile {
                payload: vec![0x30, 0x82, 0x02, 0x00],
            }),
            CommandPayload::InstallApplication(InstallApplication {
                itunes_store_id: Some(361309726),
                identifier: Some("com.example.app".into()),
                not_managed: Some(false),
                ..Default::default()
            }),
            CommandPayload::RestartDevice,
        ];

        for payload in payloads {
            let event = CommandEvent::new("UDID-ABC", Command::new(payload));
            let bytes = encode(&event).unwrap();
            let decoded: CommandEvent = decode(&bytes).unwrap();
            assert_eq!(decoded, event);
            assert_eq!(encode(&decoded).unwrap(), bytes);
        }
    }
}
