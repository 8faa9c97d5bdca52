//! Device Store service.
//!
//! Subscribes to Authenticate, TokenUpdate and CheckOut events and maintains
//! one device record per UDID. Bad events are logged and skipped; the loop
//! only ends when the bus shuts down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetmdm_core::checkin::{Authenticate, CheckOut, CheckinMessage, TokenUpdate};
use fleetmdm_core::event::{decode, CheckinEvent, Event};
use fleetmdm_core::{topics, Error, EventBus, Result, Subscription};
use fleetmdm_storage::{spawn_blocking, DeviceRecord, DeviceStorage, Store};

const SUBSCRIBER: &str = "device-store";

/// Device Store service.
pub struct DeviceStore {
    bus: EventBus,
    devices: DeviceStorage,
    running: Arc<AtomicBool>,
}

impl DeviceStore {
    pub fn new(bus: EventBus, store: &Store) -> Self {
        Self {
            bus,
            devices: store.devices(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe and spawn the consumer loop.
    ///
    /// Subscriptions are registered before this returns, so check-ins
    /// published afterwards are all observed.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Internal("device store already started".into()));
        }

        let authenticate = self.bus.subscribe(SUBSCRIBER, topics::AUTHENTICATE).await?;
        let token_update = self.bus.subscribe(SUBSCRIBER, topics::TOKEN_UPDATE).await?;
        let check_out = self.bus.subscribe(SUBSCRIBER, topics::CHECK_OUT).await?;
        let mut checkins = CheckinMerge::new([authenticate, token_update, check_out]);
        let devices = self.devices.clone();
        let running = self.running.clone();

        Ok(tokio::spawn(async move {
            info!("Device store started");
            while let Some(event) = checkins.next().await {
                let topic = event.topic.clone();
                if let Err(e) = handle_event(&devices, event).await {
                    warn!(topic = %topic, error = %e, "Failed to apply check-in event");
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Device store stopped");
        }))
    }

    pub async fn device_by_udid(&self, udid: &str) -> Result<DeviceRecord> {
        let devices = self.devices.clone();
        let key = udid.to_string();
        spawn_blocking(move || devices.get(&key))
            .await?
            .ok_or_else(|| Error::not_found(format!("device {}", udid)))
    }

    pub async fn device_by_serial(&self, serial: &str) -> Result<DeviceRecord> {
        let devices = self.devices.clone();
        let key = serial.to_string();
        spawn_blocking(move || devices.by_serial(&key))
            .await?
            .ok_or_else(|| Error::not_found(format!("device with serial {}", serial)))
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let devices = self.devices.clone();
        Ok(spawn_blocking(move || devices.list()).await?)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Yields check-ins from the three topic subscriptions in bus dispatch order.
///
/// The dispatcher hands each event to its channel before it takes the next
/// one, so once any subscription has an event ready, every event with a
/// lower sequence is already sitting in its own channel.
struct CheckinMerge {
    subscriptions: [Subscription; 3],
    heads: [Option<Event>; 3],
}

impl CheckinMerge {
    fn new(subscriptions: [Subscription; 3]) -> Self {
        Self {
            subscriptions,
            heads: [None, None, None],
        }
    }

    /// Next event by sequence. `None` once the bus has shut down and
    /// everything buffered has been yielded.
    async fn next(&mut self) -> Option<Event> {
        if self.heads.iter().all(Option::is_none) {
            let [authenticate, token_update, check_out] = &mut self.subscriptions;
            let (slot, event) = tokio::select! {
                Some(event) = authenticate.recv() => (0, event),
                Some(event) = token_update.recv() => (1, event),
                Some(event) = check_out.recv() => (2, event),
                else => return None,
            };
            self.heads[slot] = Some(event);
        }

        for (head, subscription) in self.heads.iter_mut().zip(self.subscriptions.iter_mut()) {
            if head.is_none() {
                *head = subscription.try_recv();
            }
        }

        let slot = self
            .heads
            .iter()
            .enumerate()
            .filter_map(|(slot, head)| head.as_ref().map(|event| (slot, event.sequence)))
            .min_by_key(|&(_, sequence)| sequence)
            .map(|(slot, _)| slot)?;
        self.heads[slot].take()
    }
}

async fn handle_event(devices: &DeviceStorage, event: Event) -> Result<()> {
    let checkin: CheckinEvent = decode(&event.payload)?;
    let devices = devices.clone();
    tokio::task::spawn_blocking(move || apply(&devices, &checkin.message)).await?
}

/// Apply one check-in to the device bucket.
pub(crate) fn apply(devices: &DeviceStorage, message: &CheckinMessage) -> Result<()> {
    match message {
        CheckinMessage::Authenticate(auth) => apply_authenticate(devices, auth),
        CheckinMessage::TokenUpdate(update) => apply_token_update(devices, update),
        CheckinMessage::CheckOut(check_out) => apply_check_out(devices, check_out),
    }
}

fn apply_authenticate(devices: &DeviceStorage, auth: &Authenticate) -> Result<()> {
    let record = DeviceRecord::from_authenticate(auth);
    if devices.insert_if_absent(&record)? {
        info!(
            udid = %auth.udid,
            serial_number = %auth.serial_number,
            model = %auth.model,
            "Device created"
        );
    } else {
        debug!(udid = %auth.udid, "Authenticate for known device, unchanged");
    }
    Ok(())
}

fn apply_token_update(devices: &DeviceStorage, update: &TokenUpdate) -> Result<()> {
    if update.is_user_scoped() {
        debug!(udid = %update.udid, "Skipping user-channel TokenUpdate");
        return Ok(());
    }
    devices.update(&update.udid, |device| {
        device.push_token = update.token.clone();
        device.push_magic = update.push_magic.clone();
        device.unlock_token = update.unlock_token.clone();
        device.awaiting_configuration = update.awaiting_configuration;
        if !update.topic.is_empty() {
            device.topic = update.topic.clone();
        }
        device.enrolled = true;
        device.last_seen = Utc::now();
    })?;
    info!(udid = %update.udid, "Device enrolled");
    Ok(())
}

fn apply_check_out(devices: &DeviceStorage, check_out: &CheckOut) -> Result<()> {
    devices.update(&check_out.udid, |device| {
        device.enrolled = false;
        device.last_seen = Utc::now();
    })?;
    info!(udid = %check_out.udid, "Device checked out");
    Ok(())
}
