//! Command Queue service.
//!
//! Consumes `mdm.Command` events into per-device persisted queues, wakes
//! devices whose queue was empty, and serves the connect/acknowledge
//! exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetmdm_core::config::queue::DEFAULT_REDELIVER_AFTER_SECS;
use fleetmdm_core::connect::ConnectResponse;
use fleetmdm_core::event::{decode, encode, ConnectEvent};
use fleetmdm_core::{topics, validation_err, DeviceWaker, Error, EventBus, Result};
use fleetmdm_storage::{spawn_blocking, QueueStorage, QueuedCommand, Store};

use crate::ack::{process, Exchange};
use crate::command::Command;
use crate::events::CommandEvent;

const SUBSCRIBER: &str = "command-queue";

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// An in-flight command is offered again on Idle after this long
    /// without an outcome.
    pub redeliver_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redeliver_after: Duration::from_secs(DEFAULT_REDELIVER_AFTER_SECS),
        }
    }
}

/// Per-device command queues and the connect protocol handler.
#[derive(Clone)]
pub struct CommandQueue {
    bus: EventBus,
    queues: QueueStorage,
    waker: Arc<dyn DeviceWaker>,
    config: QueueConfig,
    running: Arc<AtomicBool>,
}

impl CommandQueue {
    pub fn new(bus: EventBus, store: &Store, waker: Arc<dyn DeviceWaker>) -> Self {
        Self {
            bus,
            queues: store.queues(),
            waker,
            config: QueueConfig::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to `mdm.Command` and spawn the consumer loop.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Internal("command queue already started".into()));
        }

        let mut commands = self.bus.subscribe(SUBSCRIBER, topics::COMMAND).await?;
        let queue = self.clone();

        Ok(tokio::spawn(async move {
            info!("Command queue started");
            while let Some(event) = commands.recv().await {
                let result = match decode::<CommandEvent>(&event.payload) {
                    Ok(event) => queue.enqueue(&event.udid, &event.command).await.map(|was_empty| {
                        if was_empty {
                            queue.wake(event.udid);
                        }
                    }),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to enqueue command");
                }
            }
            queue.running.store(false, Ordering::SeqCst);
            info!("Command queue stopped");
        }))
    }

    /// Append `command` to the tail of the queue for `udid`.
    ///
    /// Returns whether the queue was empty, i.e. whether the device needs a
    /// wake. Enqueueing a UUID that is already queued is a validation error.
    pub async fn enqueue(&self, udid: &str, command: &Command) -> Result<bool> {
        if udid.is_empty() {
            return Err(validation_err!("enqueue with an empty UDID"));
        }
        let queued = QueuedCommand {
            uuid: command.uuid.clone(),
            request_type: command.request_type().to_string(),
            payload: command.to_wire()?,
            enqueued_at: Utc::now(),
        };
        let queues = self.queues.clone();
        let key = udid.to_string();
        let was_empty = tokio::task::spawn_blocking(move || {
            queues.update(&key, |queue| {
                if queue.commands.iter().any(|c| c.uuid == queued.uuid) {
                    return Err(validation_err!("command {} is already queued", queued.uuid));
                }
                Ok::<_, Error>(queue.push(queued))
            })
        })
        .await??;

        debug!(
            udid = %udid,
            command_uuid = %command.uuid,
            request_type = command.request_type(),
            was_empty,
            "Command enqueued"
        );
        Ok(was_empty)
    }

    /// Process one connect exchange and return the next payload, if any.
    ///
    /// The whole read-decide-write sequence runs in one store transaction,
    /// so concurrent exchanges for a device never receive the same command.
    pub async fn acknowledge(&self, response: &ConnectResponse) -> Result<Option<Vec<u8>>> {
        if response.is_user_scoped() {
            return Err(Error::protocol_reject(
                "user-scoped connect responses are not handled",
            ));
        }
        response.validate()?;

        let queues = self.queues.clone();
        let redeliver_after = self.config.redeliver_after;
        let owned = response.clone();
        let result = tokio::task::spawn_blocking(move || {
            queues.update(&owned.udid, |queue| {
                process(queue, &owned, Utc::now(), redeliver_after)
            })
        })
        .await?;

        let exchange = match result {
            Ok(exchange) => exchange,
            Err(e) => {
                if matches!(e, Error::Validation(_)) {
                    warn!(
                        udid = %response.udid,
                        status = %response.status,
                        command_uuid = response.command_uuid.as_deref().unwrap_or(""),
                        error = %e,
                        "Rejected connect response"
                    );
                }
                return Err(e);
            }
        };

        log_exchange(response, &exchange);
        self.bus
            .publish(topics::CONNECT, encode(&ConnectEvent::new(response.clone()))?);
        Ok(exchange.payload)
    }

    /// Queued commands for `udid` in delivery order, the in-flight one first.
    pub async fn pending(&self, udid: &str) -> Result<Vec<Command>> {
        let queues = self.queues.clone();
        let key = udid.to_string();
        let queue = spawn_blocking(move || queues.get(&key)).await?;
        queue
            .commands
            .iter()
            .map(|c| Command::decode_wire(&c.payload))
            .collect()
    }

    pub async fn queue_len(&self, udid: &str) -> Result<usize> {
        let queues = self.queues.clone();
        let key = udid.to_string();
        Ok(spawn_blocking(move || queues.get(&key)).await?.len())
    }

    /// Drop every queued command for `udid`. Returns how many were removed.
    pub async fn clear(&self, udid: &str) -> Result<usize> {
        let queues = self.queues.clone();
        let key = udid.to_string();
        let removed = spawn_blocking(move || queues.clear(&key)).await?;
        info!(udid = %udid, removed, "Command queue cleared");
        Ok(removed)
    }

    /// Wake every device with pending commands.
    ///
    /// Bus traffic is not durable, so after a restart the persisted queues
    /// are the only record of undelivered work. Returns how many devices
    /// were woken.
    pub async fn reconcile(&self) -> Result<usize> {
        let queues = self.queues.clone();
        let udids = spawn_blocking(move || queues.pending_udids()).await?;
        let mut woken = 0;
        for udid in &udids {
            match self.waker.wake(udid).await {
                Ok(_) => woken += 1,
                Err(e) => warn!(udid = %udid, error = %e, "Failed to wake device during reconcile"),
            }
        }
        info!(pending = udids.len(), woken, "Command queues reconciled");
        Ok(woken)
    }

    fn wake(&self, udid: String) {
        let waker = self.waker.clone();
        tokio::spawn(async move {
            match waker.wake(&udid).await {
                Ok(message_id) => debug!(udid = %udid, message_id = %message_id, "Wake sent"),
                Err(e) => warn!(udid = %udid, error = %e, "Failed to wake device"),
            }
        });
    }
}

fn log_exchange(response: &ConnectResponse, exchange: &Exchange) {
    if let Some((command, status)) = &exchange.completed {
        if status.is_failure() {
            let chain: Vec<String> = response
                .error_chain
                .iter()
                .map(|e| {
                    format!(
                        "{}:{} {}",
                        e.error_domain, e.error_code, e.localized_description
                    )
                })
                .collect();
            warn!(
                udid = %response.udid,
                command_uuid = %command.uuid,
                request_type = %command.request_type,
                status = %status,
                error_chain = ?chain,
                "Command failed on device"
            );
        } else {
            info!(
                udid = %response.udid,
                command_uuid = %command.uuid,
                request_type = %command.request_type,
                "Command acknowledged"
            );
        }
    }
    if let Some(uuid) = &exchange.delivered {
        debug!(
            udid = %response.udid,
            command_uuid = %uuid,
            redelivered = exchange.redelivered,
            remaining = exchange.remaining,
            "Command delivered"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandPayload;
    use fleetmdm_core::NoopWaker;

    fn queue() -> CommandQueue {
        CommandQueue::new(EventBus::new(), &Store::memory().unwrap(), Arc::new(NoopWaker))
    }

    #[tokio::test]
    async fn test_enqueue_reports_was_empty() {
        let queue = queue();
        let first = Command::new(CommandPayload::ProfileList);
        let second = Command::new(CommandPayload::SecurityInfo);
        assert!(queue.enqueue("UDID-ABC", &first).await.unwrap());
        assert!(!queue.enqueue("UDID-ABC", &second).await.unwrap());
        assert_eq!(queue.queue_len("UDID-ABC").await.unwrap(), 2);
        assert_eq!(queue.pending("UDID-ABC").await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_duplicate_uuid_rejected() {
        let queue = queue();
        let command = Command::new(CommandPayload::ProfileList);
        queue.enqueue("UDID-ABC", &command).await.unwrap();
        assert!(matches!(
            queue.enqueue("UDID-ABC", &command).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(queue.queue_len("UDID-ABC").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_user_scoped_response_is_protocol_reject() {
        let queue = queue();
        let mut response = ConnectResponse::idle("UDID-ABC");
        response.user_id = Some("user-1".into());
        assert!(matches!(
            queue.acknowledge(&response).await,
            Err(Error::ProtocolReject(_))
        ));
    }

    #[tokio::test]
    async fn test_clear() {
        let queue = queue();
        queue
            .enqueue("UDID-ABC", &Command::new(CommandPayload::ProfileList))
            .await
            .unwrap();
        assert_eq!(queue.clear("UDID-ABC").await.unwrap(), 1);
        assert_eq!(queue.queue_len("UDID-ABC").await.unwrap(), 0);
        assert_eq!(
            queue
                .acknowledge(&ConnectResponse::idle("UDID-ABC"))
                .await
                .unwrap(),
            None
        );
    }
}
