//! Audit consumer: an independent observer of command creation and
//! connect exchanges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetmdm_commands::CommandEvent;
use fleetmdm_core::event::{decode, ConnectEvent};
use fleetmdm_core::{topics, EventBus, Result};

const SUBSCRIBER: &str = "audit";

/// Counts of audited events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditCounts {
    pub commands: u64,
    pub connects: u64,
    pub undecodable: u64,
}

/// Logs every `mdm.Command` and `mdm.Connect` event.
#[derive(Clone, Default)]
pub struct AuditConsumer {
    commands: Arc<AtomicU64>,
    connects: Arc<AtomicU64>,
    undecodable: Arc<AtomicU64>,
}

impl AuditConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, bus: &EventBus) -> Result<JoinHandle<()>> {
        let mut commands = bus.subscribe(SUBSCRIBER, topics::COMMAND).await?;
        let mut connects = bus.subscribe(SUBSCRIBER, topics::CONNECT).await?;
        let audit = self.clone();

        Ok(tokio::spawn(async move {
            debug!("Audit consumer started");
            loop {
                tokio::select! {
                    Some(event) = commands.recv() => match decode::<CommandEvent>(&event.payload) {
                        Ok(event) => {
                            audit.commands.fetch_add(1, Ordering::Relaxed);
                            info!(
                                category = "audit",
                                event_id = %event.id,
                                udid = %event.udid,
                                command_uuid = %event.command.uuid,
                                request_type = event.command.request_type(),
                                "Command created"
                            );
                        }
                        Err(e) => audit.reject(&event.topic, &e),
                    },
                    Some(event) = connects.recv() => match decode::<ConnectEvent>(&event.payload) {
                        Ok(event) => {
                            audit.connects.fetch_add(1, Ordering::Relaxed);
                            info!(
                                category = "audit",
                                event_id = %event.id,
                                udid = %event.response.udid,
                                status = %event.response.status,
                                command_uuid = event.response.command_uuid.as_deref().unwrap_or(""),
                                "Connect processed"
                            );
                        }
                        Err(e) => audit.reject(&event.topic, &e),
                    },
                    else => break,
                }
            }
            debug!("Audit consumer stopped");
        }))
    }

    pub fn counts(&self) -> AuditCounts {
        AuditCounts {
            commands: self.commands.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            undecodable: self.undecodable.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, topic: &str, error: &fleetmdm_core::Error) {
        self.undecodable.fetch_add(1, Ordering::Relaxed);
        warn!(category = "audit", topic = %topic, error = %error, "Undecodable event");
    }
}
