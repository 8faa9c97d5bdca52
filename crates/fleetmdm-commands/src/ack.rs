//! Connect/acknowledge state machine.
//!
//! [`process`] applies one device response to one device queue. It is pure
//! apart from the queue it mutates, so the caller decides the transaction
//! boundary; [`crate::queue::CommandQueue`] runs it inside a single store
//! write transaction.
//!
//! | State      | Response                         | Result                                   |
//! |------------|----------------------------------|------------------------------------------|
//! | Empty      | Idle                             | empty                                    |
//! | HasPending | Idle                             | head marked in flight, payload returned  |
//! | InFlight   | Idle                             | empty, or head again once redelivery due |
//! | InFlight   | Acknowledged (head UUID)         | head removed, then as Idle               |
//! | InFlight   | Error/CommandFormatError (head)  | head removed and logged, then as Idle    |
//! | InFlight   | NotNow (head UUID)               | in-flight cleared, head kept, empty      |
//! | any        | non-Idle with other/no in-flight | `Validation`, queue untouched            |

use std::time::Duration;

use chrono::{DateTime, Utc};

use fleetmdm_core::connect::{ConnectResponse, Status};
use fleetmdm_core::{validation_err, Result};
use fleetmdm_storage::{DeviceQueue, QueuedCommand};

/// What one exchange did to the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exchange {
    /// Body to return to the device; `None` means an empty response.
    pub payload: Option<Vec<u8>>,
    /// UUID of the command handed out by this exchange.
    pub delivered: Option<String>,
    /// Command removed by this exchange, with the status that removed it.
    pub completed: Option<(QueuedCommand, Status)>,
    /// The delivered command had already been handed out once.
    pub redelivered: bool,
    /// Commands left in the queue, including any now in flight.
    pub remaining: usize,
}

/// Apply `response` to `queue`.
///
/// On `Err` the caller must discard the mutated queue.
pub fn process(
    queue: &mut DeviceQueue,
    response: &ConnectResponse,
    now: DateTime<Utc>,
    redeliver_after: Duration,
) -> Result<Exchange> {
    let mut exchange = Exchange::default();

    if response.status != Status::Idle {
        let uuid = response.command_uuid.as_deref().unwrap_or_default();
        match queue.in_flight_uuid() {
            Some(in_flight) if in_flight == uuid => {}
            Some(in_flight) => {
                return Err(validation_err!(
                    "{} for command {} but {} is in flight",
                    response.status,
                    uuid,
                    in_flight
                ))
            }
            None => {
                return Err(validation_err!(
                    "{} for command {} but no command is in flight",
                    response.status,
                    uuid
                ))
            }
        }

        match response.status {
            Status::NotNow => {
                queue.in_flight = None;
                exchange.remaining = queue.len();
                return Ok(exchange);
            }
            Status::Acknowledged | Status::Error | Status::CommandFormatError => {
                exchange.completed = queue.pop_head().map(|c| (c, response.status));
            }
            Status::Idle => {}
        }
    }

    // Idle from here on.
    if let Some(in_flight) = &queue.in_flight {
        let due = (now - in_flight.delivered_at)
            .to_std()
            .map(|elapsed| elapsed >= redeliver_after)
            .unwrap_or(false);
        if !due {
            exchange.remaining = queue.len();
            return Ok(exchange);
        }
        exchange.redelivered = true;
    }

    if let Some(head) = queue.deliver_head(now) {
        exchange.payload = Some(head.payload.clone());
        exchange.delivered = Some(head.uuid.clone());
    }
    exchange.remaining = queue.len();
    Ok(exchange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetmdm_core::Error;

    const REDELIVER: Duration = Duration::from_secs(300);

    fn queue_of(uuids: &[&str]) -> DeviceQueue {
        let mut queue = DeviceQueue::default();
        for uuid in uuids {
            queue.push(QueuedCommand {
                uuid: uuid.to_string(),
                request_type: "ProfileList".to_string(),
                payload: uuid.as_bytes().to_vec(),
                enqueued_at: Utc::now(),
            });
        }
        queue
    }

    fn idle() -> ConnectResponse {
        ConnectResponse::idle("UDID-ABC")
    }

    fn reply(status: Status, uuid: &str) -> ConnectResponse {
        ConnectResponse::with_status("UDID-ABC", status, uuid)
    }

    fn step(queue: &mut DeviceQueue, response: ConnectResponse) -> Result<Exchange> {
        process(queue, &response, Utc::now(), REDELIVER)
    }

    #[test]
    fn test_fifo_delivery() {
        let mut queue = queue_of(&["c1", "c2", "c3"]);

        let first = step(&mut queue, idle()).unwrap();
        assert_eq!(first.payload, Some(b"c1".to_vec()));
        assert_eq!(first.remaining, 3);

        let second = step(&mut queue, reply(Status::Acknowledged, "c1")).unwrap();
        assert_eq!(second.payload, Some(b"c2".to_vec()));
        assert_eq!(second.completed.unwrap().0.uuid, "c1");

        let third = step(&mut queue, reply(Status::Acknowledged, "c2")).unwrap();
        assert_eq!(third.payload, Some(b"c3".to_vec()));

        let done = step(&mut queue, reply(Status::Acknowledged, "c3")).unwrap();
        assert_eq!(done.payload, None);
        assert_eq!(done.remaining, 0);
        assert!(queue.in_flight.is_none());
    }

    #[test]
    fn test_idle_on_empty_queue() {
        let mut queue = DeviceQueue::default();
        let exchange = step(&mut queue, idle()).unwrap();
        assert_eq!(exchange, Exchange::default());
    }

    #[test]
    fn test_idle_while_in_flight_returns_empty() {
        let mut queue = queue_of(&["c1", "c2"]);
        step(&mut queue, idle()).unwrap();

        let again = step(&mut queue, idle()).unwrap();
        assert_eq!(again.payload, None);
        assert_eq!(queue.in_flight_uuid(), Some("c1"));
    }

    #[test]
    fn test_idle_redelivers_after_timeout() {
        let mut queue = queue_of(&["c1"]);
        let delivered_at = Utc::now() - chrono::Duration::seconds(600);
        process(&mut queue, &idle(), delivered_at, REDELIVER).unwrap();

        let again = step(&mut queue, idle()).unwrap();
        assert_eq!(again.payload, Some(b"c1".to_vec()));
        assert!(again.redelivered);
        assert!(queue.in_flight.as_ref().unwrap().delivered_at > delivered_at);
    }

    #[test]
    fn test_not_now_keeps_head() {
        let mut queue = queue_of(&["c1", "c2"]);
        step(&mut queue, idle()).unwrap();

        let not_now = step(&mut queue, reply(Status::NotNow, "c1")).unwrap();
        assert_eq!(not_now.payload, None);
        assert!(not_now.completed.is_none());
        assert!(queue.in_flight.is_none());

        let retry = step(&mut queue, idle()).unwrap();
        assert_eq!(retry.payload, Some(b"c1".to_vec()));
    }

    #[test]
    fn test_error_removes_head() {
        for status in [Status::Error, Status::CommandFormatError] {
            let mut queue = queue_of(&["c1", "c2"]);
            step(&mut queue, idle()).unwrap();

            let exchange = step(&mut queue, reply(status, "c1")).unwrap();
            let (removed, removed_by) = exchange.completed.unwrap();
            assert_eq!(removed.uuid, "c1");
            assert_eq!(removed_by, status);
            assert_eq!(exchange.payload, Some(b"c2".to_vec()));
            assert!(queue.commands.iter().all(|c| c.uuid != "c1"));
        }
    }

    #[test]
    fn test_mismatched_uuid_is_rejected() {
        let mut queue = queue_of(&["c1", "c2"]);
        step(&mut queue, idle()).unwrap();
        let before = queue.clone();

        let result = step(&mut queue, reply(Status::Acknowledged, "c2"));
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(queue, before);
    }

    #[test]
    fn test_ack_without_in_flight_is_rejected() {
        let mut queue = queue_of(&["c1"]);
        let result = step(&mut queue, reply(Status::Acknowledged, "c1"));
        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(queue.in_flight.is_none());
    }

    #[test]
    fn test_duplicate_ack_is_rejected() {
        let mut queue = queue_of(&["c1", "c2"]);
        step(&mut queue, idle()).unwrap();
        step(&mut queue, reply(Status::Acknowledged, "c1")).unwrap();

        let duplicate = step(&mut queue, reply(Status::Acknowledged, "c1"));
        assert!(matches!(duplicate, Err(Error::Validation(_))));
        assert_eq!(queue.in_flight_uuid(), Some("c2"));
    }
}
