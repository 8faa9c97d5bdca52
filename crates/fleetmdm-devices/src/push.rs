//! Push Trigger: wakes a device through an opaque push-send capability.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use fleetmdm_core::config::push::MAX_TOKEN_LEN;
use fleetmdm_core::{DeviceWaker, Error, Result};
use fleetmdm_storage::{spawn_blocking, PushInfoStorage, Store};

/// Delivers a push notification. The transport behind it is out of scope.
#[async_trait]
pub trait PushSender: Send + Sync {
    /// Send `payload` to the device identified by the hex-encoded `token` on
    /// `topic`. Returns the transport's message id.
    async fn send(&self, token: &str, topic: &str, payload: &[u8]) -> Result<String>;
}

/// Hex characters of a token kept in logs.
const LOGGED_TOKEN_CHARS: usize = 8;

/// Development sender: logs the push and returns a fresh id.
///
/// Only a token prefix is logged; the full token and the push magic in the
/// payload stay out of the logs.
#[derive(Debug, Clone, Default)]
pub struct LoggingPushSender;

#[async_trait]
impl PushSender for LoggingPushSender {
    async fn send(&self, token: &str, topic: &str, payload: &[u8]) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        debug!(
            token_prefix = token_prefix(token),
            topic = %topic,
            payload_len = payload.len(),
            message_id = %id,
            "Push sent"
        );
        Ok(id)
    }
}

fn token_prefix(token: &str) -> &str {
    token
        .char_indices()
        .nth(LOGGED_TOKEN_CHARS)
        .map_or(token, |(end, _)| &token[..end])
}

/// A device token is structurally valid when it is non-empty and no longer
/// than [`MAX_TOKEN_LEN`] bytes.
pub fn validate_token(token: &[u8]) -> Result<()> {
    if token.is_empty() {
        return Err(Error::InvalidToken("push token is empty".into()));
    }
    if token.len() > MAX_TOKEN_LEN {
        return Err(Error::InvalidToken(format!(
            "push token is {} bytes, at most {} allowed",
            token.len(),
            MAX_TOKEN_LEN
        )));
    }
    Ok(())
}

/// Minimal wake payload: `{"mdm":"<PushMagic>"}`.
pub fn wake_payload(push_magic: &str) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&serde_json::json!({ "mdm": push_magic }))?)
}

/// Looks up push credentials and wakes the device.
#[derive(Clone)]
pub struct PushTrigger {
    push_info: PushInfoStorage,
    sender: Arc<dyn PushSender>,
    default_topic: String,
}

impl PushTrigger {
    pub fn new(store: &Store, sender: Arc<dyn PushSender>) -> Self {
        Self {
            push_info: store.push_info(),
            sender,
            default_topic: String::new(),
        }
    }

    /// Topic used when the device did not report one.
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = topic.into();
        self
    }

    /// Wake `udid`. Returns the push message id.
    pub async fn push(&self, udid: &str) -> Result<String> {
        let push_info = self.push_info.clone();
        let key = udid.to_string();
        let info = spawn_blocking(move || push_info.get(&key))
            .await?
            .ok_or_else(|| Error::not_found(format!("push info for {}", udid)))?;

        validate_token(&info.token)?;
        let payload = wake_payload(&info.push_magic)?;
        let topic = if info.topic.is_empty() {
            self.default_topic.as_str()
        } else {
            info.topic.as_str()
        };

        let message_id = self
            .sender
            .send(&hex::encode(&info.token), topic, &payload)
            .await?;
        debug!(udid = %udid, message_id = %message_id, "Device woken");
        Ok(message_id)
    }
}

#[async_trait]
impl DeviceWaker for PushTrigger {
    async fn wake(&self, udid: &str) -> Result<String> {
        self.push(udid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_token() {
        assert!(validate_token(b"T1").is_ok());
        assert!(validate_token(&[0u8; 32]).is_ok());
        assert!(matches!(validate_token(&[]), Err(Error::InvalidToken(_))));
        assert!(matches!(
            validate_token(&[1u8; MAX_TOKEN_LEN + 1]),
            Err(Error::InvalidToken(_))
        ));
    }

    #[test]
    fn test_wake_payload() {
        assert_eq!(wake_payload("M1").unwrap(), br#"{"mdm":"M1"}"#.to_vec());
    }

    #[test]
    fn test_token_prefix() {
        let token = hex::encode([0xabu8; 32]);
        assert_eq!(token_prefix(&token), "abababab");
        assert_eq!(token_prefix("5431"), "5431");
        assert_eq!(token_prefix(""), "");
    }

    #[tokio::test]
    async fn test_logging_sender_returns_fresh_ids() {
        let sender = LoggingPushSender;
        let first = sender.send("5431", "com.apple.mgmt.test", b"{}").await.unwrap();
        let second = sender.send("5431", "com.apple.mgmt.test", b"{}").await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_push_unknown_device_is_not_found() {
        let store = Store::memory().unwrap();
        let trigger = PushTrigger::new(&store, Arc::new(LoggingPushSender));
        assert!(matches!(
            trigger.push("UDID-missing").await,
            Err(Error::NotFound(_))
        ));
    }
}
