//! End-to-end tests for check-in ingestion and push wake.
//!
//! Tests include:
//! - Authenticate + TokenUpdate through the bus enrolls a device
//! - CheckOut un-enrolls it, and a later re-enrollment wins
//! - Device records survive reopening an on-disk store
//! - Push uses the stored credentials
//! - Bad events do not stop the consumer loops

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetmdm_core::{Error, EventBus, Result};
use fleetmdm_devices::{CheckinService, DeviceStore, PushInfoStore, PushSender, PushTrigger};
use fleetmdm_storage::Store;
use tempfile::TempDir;

/// Records every push instead of sending it.
#[derive(Default)]
struct RecordingPushSender {
    sent: Mutex<Vec<(String, String, Vec<u8>)>>,
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(&self, token: &str, topic: &str, payload: &[u8]) -> Result<String> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((token.to_string(), topic.to_string(), payload.to_vec()));
        Ok(format!("msg-{}", sent.len()))
    }
}

/// Poll `check` until it yields a value or two seconds pass.
async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

struct Harness {
    checkins: CheckinService,
    devices: DeviceStore,
    push_info: PushInfoStore,
    store: Store,
}

async fn harness() -> Harness {
    let bus = EventBus::new();
    let store = Store::memory().unwrap();
    let devices = DeviceStore::new(bus.clone(), &store);
    let push_info = PushInfoStore::new(bus.clone(), &store);
    devices.start().await.unwrap();
    push_info.start().await.unwrap();
    Harness {
        checkins: CheckinService::new(bus),
        devices,
        push_info,
        store,
    }
}

const AUTHENTICATE: &[u8] = br#"{
    "MessageType": "Authenticate",
    "UDID": "UDID-ABC",
    "SerialNumber": "C02XYZ",
    "OSVersion": "17.4",
    "BuildVersion": "21E219",
    "Model": "iPhone"
}"#;

const TOKEN_UPDATE: &[u8] = br#"{
    "MessageType": "TokenUpdate",
    "UDID": "UDID-ABC",
    "Topic": "com.apple.mgmt.test",
    "Token": "VDE=",
    "PushMagic": "M1",
    "UnlockToken": "AQID"
}"#;

#[tokio::test]
async fn test_authenticate_then_token_update_enrolls() {
    let h = harness().await;
    let devices = &h.devices;
    h.checkins.handle_body(AUTHENTICATE).unwrap();
    h.checkins.handle_body(TOKEN_UPDATE).unwrap();

    let device = eventually(move || async move {
        devices
            .device_by_udid("UDID-ABC")
            .await
            .ok()
            .filter(|d| d.enrolled)
    })
    .await;

    assert_eq!(device.serial_number, "C02XYZ");
    assert_eq!(device.push_token, b"T1".to_vec());
    assert_eq!(device.push_magic, "M1");
    assert_eq!(device.unlock_token, vec![1, 2, 3]);
    assert_eq!(device.topic, "com.apple.mgmt.test");

    let by_serial = h.devices.device_by_serial("C02XYZ").await.unwrap();
    assert_eq!(by_serial.uuid, device.uuid);
}

#[tokio::test]
async fn test_check_out_unenrolls() {
    let h = harness().await;
    let devices = &h.devices;
    h.checkins.handle_body(AUTHENTICATE).unwrap();
    h.checkins.handle_body(TOKEN_UPDATE).unwrap();
    eventually(move || async move {
        devices
            .device_by_udid("UDID-ABC")
            .await
            .ok()
            .filter(|d| d.enrolled)
    })
    .await;

    h.checkins
        .handle_body(br#"{"MessageType": "CheckOut", "UDID": "UDID-ABC"}"#)
        .unwrap();
    let device = eventually(move || async move {
        devices
            .device_by_udid("UDID-ABC")
            .await
            .ok()
            .filter(|d| !d.enrolled)
    })
    .await;
    assert_eq!(device.push_magic, "M1");
}

#[tokio::test]
async fn test_check_out_then_reenroll_ends_enrolled() {
    let h = harness().await;
    let devices = &h.devices;
    h.checkins.handle_body(AUTHENTICATE).unwrap();
    h.checkins.handle_body(TOKEN_UPDATE).unwrap();
    eventually(move || async move {
        devices
            .device_by_udid("UDID-ABC")
            .await
            .ok()
            .filter(|d| d.enrolled)
    })
    .await;

    // Published back to back, so the store sees all three at once.
    h.checkins
        .handle_body(br#"{"MessageType": "CheckOut", "UDID": "UDID-ABC"}"#)
        .unwrap();
    h.checkins.handle_body(AUTHENTICATE).unwrap();
    h.checkins
        .handle_body(&replaced(TOKEN_UPDATE, "M1", "M2"))
        .unwrap();
    // Applied after everything above.
    h.checkins
        .handle_body(&replaced(AUTHENTICATE, "UDID-ABC", "UDID-LAST"))
        .unwrap();
    eventually(move || async move { devices.device_by_udid("UDID-LAST").await.ok() }).await;

    let device = h.devices.device_by_udid("UDID-ABC").await.unwrap();
    assert!(device.enrolled);
    assert_eq!(device.push_magic, "M2");
}

#[tokio::test]
async fn test_device_record_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("devices.redb");

    let bus = EventBus::new();
    let store = Store::open(&path).unwrap();
    let devices = DeviceStore::new(bus.clone(), &store);
    let handle = devices.start().await.unwrap();
    let checkins = CheckinService::new(bus.clone());
    checkins.handle_body(AUTHENTICATE).unwrap();
    checkins.handle_body(TOKEN_UPDATE).unwrap();
    let devices_ref = &devices;
    let enrolled = eventually(move || async move {
        devices_ref
            .device_by_udid("UDID-ABC")
            .await
            .ok()
            .filter(|d| d.enrolled)
    })
    .await;

    bus.shutdown();
    handle.await.unwrap();
    assert!(!devices.is_running());
    drop(devices);
    drop(store);

    let store = Store::open(&path).unwrap();
    let devices = DeviceStore::new(EventBus::new(), &store);
    let reopened = devices.device_by_serial("C02XYZ").await.unwrap();
    assert_eq!(reopened.uuid, enrolled.uuid);
    assert!(reopened.enrolled);
    assert_eq!(reopened.push_token, b"T1".to_vec());
    assert_eq!(reopened.topic, "com.apple.mgmt.test");
}

#[tokio::test]
async fn test_unknown_device_lookup() {
    let h = harness().await;
    assert!(matches!(
        h.devices.device_by_udid("UDID-missing").await,
        Err(Error::NotFound(_))
    ));
    assert!(h.devices.list_devices().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_loop_survives_token_update_for_unknown_device() {
    let h = harness().await;
    let (devices, push_info) = (&h.devices, &h.push_info);
    // No Authenticate yet: the device store logs NotFound and keeps going.
    h.checkins
        .handle_body(&token_update_for("UDID-GHOST"))
        .unwrap();
    h.checkins.handle_body(AUTHENTICATE).unwrap();

    eventually(move || async move { devices.device_by_udid("UDID-ABC").await.ok() }).await;
    assert!(h.devices.is_running());
    assert!(matches!(
        h.devices.device_by_udid("UDID-GHOST").await,
        Err(Error::NotFound(_))
    ));
    // The push info store is independent of device records.
    eventually(move || async move { push_info.push_info("UDID-GHOST").await.ok() }).await;
}

#[tokio::test]
async fn test_push_uses_stored_credentials() {
    let h = harness().await;
    let push_info = &h.push_info;
    h.checkins.handle_body(AUTHENTICATE).unwrap();
    h.checkins.handle_body(TOKEN_UPDATE).unwrap();
    eventually(move || async move { push_info.push_info("UDID-ABC").await.ok() }).await;

    let sender = Arc::new(RecordingPushSender::default());
    let trigger = PushTrigger::new(&h.store, sender.clone());
    let message_id = trigger.push("UDID-ABC").await.unwrap();
    assert_eq!(message_id, "msg-1");

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, hex_of(b"T1"));
    assert_eq!(sent[0].1, "com.apple.mgmt.test");
    assert_eq!(sent[0].2, br#"{"mdm":"M1"}"#.to_vec());
}

#[tokio::test]
async fn test_push_rejects_malformed_token() {
    let h = harness().await;
    let push_info = &h.push_info;
    h.checkins
        .handle_body(
            br#"{"MessageType": "TokenUpdate", "UDID": "UDID-EMPTY", "Token": "", "PushMagic": "M"}"#,
        )
        .unwrap();
    eventually(move || async move { push_info.push_info("UDID-EMPTY").await.ok() }).await;

    let sender = Arc::new(RecordingPushSender::default());
    let trigger = PushTrigger::new(&h.store, sender.clone());
    assert!(matches!(
        trigger.push("UDID-EMPTY").await,
        Err(Error::InvalidToken(_))
    ));
    assert!(sender.sent.lock().unwrap().is_empty());
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn token_update_for(udid: &str) -> Vec<u8> {
    replaced(TOKEN_UPDATE, "UDID-ABC", udid)
}

fn replaced(body: &[u8], from: &str, to: &str) -> Vec<u8> {
    String::from_utf8_lossy(body).replace(from, to).into_bytes()
}
