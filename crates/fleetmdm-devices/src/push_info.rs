//! Push Info Store service.
//!
//! Keeps the push credentials from device-level TokenUpdate events, keyed by
//! UDID, independently of the device record.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetmdm_core::checkin::{CheckinMessage, TokenUpdate};
use fleetmdm_core::event::{decode, CheckinEvent};
use fleetmdm_core::{topics, Error, EventBus, Result};
use fleetmdm_storage::{spawn_blocking, PushInfo, PushInfoStorage, Store};

const SUBSCRIBER: &str = "push-info-store";

pub struct PushInfoStore {
    bus: EventBus,
    push_info: PushInfoStorage,
    running: Arc<AtomicBool>,
}

impl PushInfoStore {
    pub fn new(bus: EventBus, store: &Store) -> Self {
        Self {
            bus,
            push_info: store.push_info(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to TokenUpdate and spawn the consumer loop.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Internal("push info store already started".into()));
        }

        let mut token_update = self.bus.subscribe(SUBSCRIBER, topics::TOKEN_UPDATE).await?;
        let push_info = self.push_info.clone();
        let running = self.running.clone();

        Ok(tokio::spawn(async move {
            info!("Push info store started");
            while let Some(event) = token_update.recv().await {
                let result = match decode::<CheckinEvent>(&event.payload) {
                    Ok(CheckinEvent {
                        message: CheckinMessage::TokenUpdate(update),
                        ..
                    }) => {
                        let push_info = push_info.clone();
                        spawn_blocking(move || store_token_update(&push_info, &update))
                            .await
                            .map_err(Error::from)
                    }
                    Ok(other) => Err(Error::validation(format!(
                        "unexpected {} on {}",
                        other.message.message_type(),
                        event.topic
                    ))),
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to store push info");
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Push info store stopped");
        }))
    }

    pub async fn push_info(&self, udid: &str) -> Result<PushInfo> {
        let push_info = self.push_info.clone();
        let key = udid.to_string();
        spawn_blocking(move || push_info.get(&key))
            .await?
            .ok_or_else(|| Error::not_found(format!("push info for {}", udid)))
    }
}

fn store_token_update(
    push_info: &PushInfoStorage,
    update: &TokenUpdate,
) -> fleetmdm_storage::Result<()> {
    if update.is_user_scoped() {
        debug!(udid = %update.udid, "Skipping user-channel TokenUpdate");
        return Ok(());
    }
    push_info.put(&PushInfo {
        udid: update.udid.clone(),
        token: update.token.clone(),
        push_magic: update.push_magic.clone(),
        topic: update.topic.clone(),
        updated_at: Utc::now(),
    })?;
    debug!(udid = %update.udid, "Push info stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_token_update() {
        let storage = Store::memory().unwrap().push_info();
        let update = TokenUpdate {
            udid: "UDID-ABC".to_string(),
            topic: "com.apple.mgmt.test".to_string(),
            token: b"T1".to_vec(),
            push_magic: "M1".to_string(),
            ..Default::default()
        };
        store_token_update(&storage, &update).unwrap();

        let info = storage.get("UDID-ABC").unwrap().unwrap();
        assert_eq!(info.token, b"T1".to_vec());
        assert_eq!(info.push_magic, "M1");
        assert_eq!(info.topic, "com.apple.mgmt.test");
    }

    #[test]
    fn test_user_channel_not_stored() {
        let storage = Store::memory().unwrap().push_info();
        let update = TokenUpdate {
            udid: "UDID-ABC".to_string(),
            user_id: Some("user-1".to_string()),
            token: b"T1".to_vec(),
            ..Default::default()
        };
        store_token_update(&storage, &update).unwrap();
        assert!(storage.get("UDID-ABC").unwrap().is_none());
    }
}
