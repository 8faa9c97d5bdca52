//! FleetMDM server: wires the event bus, stores and services together.
//!
//! [`MdmServer`] is the facade a transport calls into:
//!
//! - `checkin` publishes device check-ins for the device and push-info stores
//! - `new_command` publishes commands for the command queue
//! - `connect` runs the connect/acknowledge exchange and returns the next
//!   command payload
//!
//! On start it reconciles persisted queues so devices with undelivered
//! commands are woken even though bus traffic from before a restart is gone.

pub mod audit;
pub mod config;

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use fleetmdm_commands::{Command, CommandQueue, CommandRequest, CommandService};
use fleetmdm_core::{
    decode_connect, BusStats, CheckinMessage, ConnectResponse, EventBus, Result,
};
use fleetmdm_devices::{CheckinService, DeviceStore, PushInfoStore, PushSender, PushTrigger};
use fleetmdm_storage::{DeviceRecord, PushInfo, Store};

pub use audit::{AuditConsumer, AuditCounts};
pub use config::ServerConfig;

/// How long `shutdown` waits for each consumer loop to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Running MDM subsystem.
pub struct MdmServer {
    config: ServerConfig,
    store: Store,
    bus: EventBus,
    checkins: CheckinService,
    devices: DeviceStore,
    push_info: PushInfoStore,
    push: PushTrigger,
    commands: CommandService,
    queue: CommandQueue,
    audit: AuditConsumer,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl MdmServer {
    /// Open the store, start every consumer and reconcile pending queues.
    pub async fn start(config: ServerConfig, push_sender: Arc<dyn PushSender>) -> Result<Self> {
        config.validate()?;
        let store = Store::open(&config.storage.path)?;
        let bus = EventBus::with_config(config.bus_config());

        let devices = DeviceStore::new(bus.clone(), &store);
        let push_info = PushInfoStore::new(bus.clone(), &store);
        let push =
            PushTrigger::new(&store, push_sender).with_default_topic(config.push.topic.clone());
        let queue = CommandQueue::new(bus.clone(), &store, Arc::new(push.clone()))
            .with_config(config.queue_config());
        let audit = AuditConsumer::new();

        let handles = vec![
            ("device-store", devices.start().await?),
            ("push-info-store", push_info.start().await?),
            ("command-queue", queue.start().await?),
            ("audit", audit.start(&bus).await?),
        ];

        let server = Self {
            checkins: CheckinService::new(bus.clone()),
            commands: CommandService::new(bus.clone()),
            config,
            store,
            bus,
            devices,
            push_info,
            push,
            queue,
            audit,
            handles,
        };

        let woken = server.queue.reconcile().await?;
        info!(
            path = %server.store.path(),
            persistent = server.store.is_persistent(),
            woken,
            "MDM server started"
        );
        Ok(server)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Decode a check-in body and publish it. Returns the event id.
    pub fn checkin(&self, body: &[u8]) -> Result<String> {
        self.checkins.handle_body(body)
    }

    pub fn checkin_message(&self, message: CheckinMessage) -> Result<String> {
        self.checkins.checkin(message)
    }

    /// Decode a connect body and run the exchange.
    ///
    /// `None` means the device gets an empty response.
    pub async fn connect(&self, body: &[u8]) -> Result<Option<Vec<u8>>> {
        let response = decode_connect(body)?;
        self.queue.acknowledge(&response).await
    }

    pub async fn acknowledge(&self, response: &ConnectResponse) -> Result<Option<Vec<u8>>> {
        self.queue.acknowledge(response).await
    }

    pub fn new_command(&self, request: CommandRequest) -> Result<Command> {
        self.commands.new_command(request)
    }

    /// Wake `udid` now. Returns the push message id.
    pub async fn push(&self, udid: &str) -> Result<String> {
        self.push.push(udid).await
    }

    pub async fn device(&self, udid: &str) -> Result<DeviceRecord> {
        self.devices.device_by_udid(udid).await
    }

    pub async fn device_by_serial(&self, serial: &str) -> Result<DeviceRecord> {
        self.devices.device_by_serial(serial).await
    }

    pub async fn devices(&self) -> Result<Vec<DeviceRecord>> {
        self.devices.list_devices().await
    }

    pub async fn push_info(&self, udid: &str) -> Result<PushInfo> {
        self.push_info.push_info(udid).await
    }

    pub async fn pending_commands(&self, udid: &str) -> Result<Vec<Command>> {
        self.queue.pending(udid).await
    }

    pub async fn queue_len(&self, udid: &str) -> Result<usize> {
        self.queue.queue_len(udid).await
    }

    pub async fn clear_queue(&self, udid: &str) -> Result<usize> {
        self.queue.clear(udid).await
    }

    pub async fn bus_stats(&self) -> BusStats {
        self.bus.stats().await
    }

    pub fn audit_counts(&self) -> AuditCounts {
        self.audit.counts()
    }

    /// Stop the bus and wait for every consumer loop to finish.
    pub async fn shutdown(self) {
        self.bus.shutdown();
        for (name, handle) in self.handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(service = name, error = %e, "Service task failed"),
                Err(_) => {
                    warn!(service = name, "Service did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!("MDM server stopped");
    }
}
