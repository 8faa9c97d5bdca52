//! Check-in ingestion: turns device check-ins into bus events.

use tracing::debug;

use fleetmdm_core::checkin::{decode_checkin, CheckinMessage};
use fleetmdm_core::event::{encode, CheckinEvent};
use fleetmdm_core::{Error, EventBus, Result};

/// Publishes check-ins for the device and push-info stores to consume.
#[derive(Clone)]
pub struct CheckinService {
    bus: EventBus,
}

impl CheckinService {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Publish `message` on the topic for its type. Returns the event id.
    ///
    /// Succeeds once the event is handed to the bus; store updates happen
    /// asynchronously.
    pub fn checkin(&self, message: CheckinMessage) -> Result<String> {
        if message.udid().is_empty() {
            return Err(Error::validation("check-in has an empty UDID"));
        }
        let event = CheckinEvent::new(message);
        let payload = encode(&event)?;
        debug!(
            udid = %event.message.udid(),
            message_type = event.message.message_type(),
            event_id = %event.id,
            "Check-in received"
        );
        self.bus.publish(event.topic(), payload);
        Ok(event.id)
    }

    /// Decode a device-facing body and publish it.
    pub fn handle_body(&self, body: &[u8]) -> Result<String> {
        let message = decode_checkin(body)?;
        self.checkin(message)
    }
}
