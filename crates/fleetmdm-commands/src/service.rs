//! Command Service: the producer-facing entry point for new commands.
//!
//! Creating a command only publishes it. The queue, audit logging and any
//! other observer pick it up from `mdm.Command`.

use tracing::info;

use fleetmdm_core::event::encode;
use fleetmdm_core::{topics, validation_err, EventBus, Result};

use crate::command::{Command, CommandRequest};
use crate::events::CommandEvent;

#[derive(Clone)]
pub struct CommandService {
    bus: EventBus,
}

impl CommandService {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Create a command for `request.udid` and publish it.
    pub fn new_command(&self, request: CommandRequest) -> Result<Command> {
        if request.udid.is_empty() {
            return Err(validation_err!("command request has an empty UDID"));
        }
        request.payload.validate()?;

        let command = Command::new(request.payload);
        let event = CommandEvent::new(request.udid, command);
        self.bus.publish(topics::COMMAND, encode(&event)?);
        info!(
            udid = %event.udid,
            command_uuid = %event.command.uuid,
            request_type = event.command.request_type(),
            "Command created"
        );
        Ok(event.command)
    }
}
