//! Per-device command queue storage using redb.
//!
//! Each device's queue is one JSON record holding the ordered commands and
//! the in-flight marker. All mutation goes through [`QueueStorage::update`],
//! which reads, mutates and writes the record inside a single write
//! transaction. redb admits one writer at a time, so two exchanges for the
//! same device can never interleave.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use fleetmdm_core::codec::base64_bytes;

use crate::{Error, Result};

// Queues table: key = udid, value = DeviceQueue (JSON)
pub(crate) const QUEUES_TABLE: TableDefinition<&str, &str> = TableDefinition::new("command_queues");

/// A command waiting for delivery, already encoded for the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCommand {
    pub uuid: String,
    pub request_type: String,
    /// Device-facing wire body.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// The head command as handed to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InFlight {
    pub command_uuid: String,
    pub delivered_at: DateTime<Utc>,
}

/// Observable queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueState {
    Empty,
    HasPending,
    InFlight,
}

/// One device's queue.
///
/// Invariant: when `in_flight` is set it names `commands[0]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceQueue {
    #[serde(default)]
    pub commands: Vec<QueuedCommand>,
    #[serde(default)]
    pub in_flight: Option<InFlight>,
}

impl DeviceQueue {
    pub fn state(&self) -> QueueState {
        match (&self.in_flight, self.commands.is_empty()) {
            (Some(_), _) => QueueState::InFlight,
            (None, true) => QueueState::Empty,
            (None, false) => QueueState::HasPending,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn head(&self) -> Option<&QueuedCommand> {
        self.commands.first()
    }

    /// Append to the tail. Returns whether the queue was empty.
    pub fn push(&mut self, command: QueuedCommand) -> bool {
        let was_empty = self.commands.is_empty();
        self.commands.push(command);
        was_empty
    }

    /// Remove the head and clear the in-flight marker.
    pub fn pop_head(&mut self) -> Option<QueuedCommand> {
        self.in_flight = None;
        if self.commands.is_empty() {
            None
        } else {
            Some(self.commands.remove(0))
        }
    }

    /// Mark the head as delivered at `now` and return it.
    pub fn deliver_head(&mut self, now: DateTime<Utc>) -> Option<&QueuedCommand> {
        let head = self.commands.first()?;
        self.in_flight = Some(InFlight {
            command_uuid: head.uuid.clone(),
            delivered_at: now,
        });
        self.commands.first()
    }

    /// UUID of the in-flight command, if any.
    pub fn in_flight_uuid(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|f| f.command_uuid.as_str())
    }
}

/// Command queue storage.
#[derive(Clone)]
pub struct QueueStorage {
    db: Arc<Database>,
}

impl QueueStorage {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Current queue for `udid`; an unknown device has an empty queue.
    pub fn get(&self, udid: &str) -> Result<DeviceQueue> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUES_TABLE)?;
        match table.get(udid)? {
            Some(value) => Ok(serde_json::from_str(value.value())?),
            None => Ok(DeviceQueue::default()),
        }
    }

    /// Run `f` against the queue for `udid` inside one write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; on `Err` it is
    /// dropped and the stored queue is unchanged. A queue left empty with no
    /// in-flight marker is removed from the table.
    pub fn update<R, E, F>(&self, udid: &str, f: F) -> std::result::Result<R, E>
    where
        F: FnOnce(&mut DeviceQueue) -> std::result::Result<R, E>,
        E: From<Error>,
    {
        if udid.is_empty() {
            return Err(Error::InvalidInput("queue update with an empty UDID".into()).into());
        }
        let write_txn = self.db.begin_write().map_err(Error::from)?;
        let output = {
            let mut table = write_txn.open_table(QUEUES_TABLE).map_err(Error::from)?;
            let existing = table
                .get(udid)
                .map_err(Error::from)?
                .map(|v| v.value().to_string());
            let mut queue: DeviceQueue = match existing {
                Some(json) => serde_json::from_str(&json).map_err(Error::from)?,
                None => DeviceQueue::default(),
            };

            let output = f(&mut queue)?;

            if queue.commands.is_empty() && queue.in_flight.is_none() {
                table.remove(udid).map_err(Error::from)?;
            } else {
                let json = serde_json::to_string(&queue).map_err(Error::from)?;
                table.insert(udid, json.as_str()).map_err(Error::from)?;
            }
            output
        };
        write_txn.commit().map_err(Error::from)?;
        Ok(output)
    }

    /// UDIDs that have at least one queued command, ordered by UDID.
    pub fn pending_udids(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(QUEUES_TABLE)?;
        let mut udids = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let queue: DeviceQueue = serde_json::from_str(value.value())?;
            if !queue.is_empty() {
                udids.push(key.value().to_string());
            }
        }
        Ok(udids)
    }

    /// Drop every queued command for `udid`. Returns how many were removed.
    pub fn clear(&self, udid: &str) -> Result<usize> {
        self.update(udid, |queue| {
            let removed = queue.commands.len();
            *queue = DeviceQueue::default();
            Ok::<_, Error>(removed)
        })
    }
}
