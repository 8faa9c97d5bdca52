//! FleetMDM storage crate.
//!
//! Transactional persistence for device records, push credentials and
//! per-device command queues, backed by redb. Stores are synchronous; async
//! callers run them on a blocking thread.

pub mod db;
pub mod devices;
pub mod error;
pub mod push_info;
pub mod queue;

pub use db::{spawn_blocking, Store, MEMORY_PATH};
pub use devices::{DeviceRecord, DeviceStorage};
pub use error::{Error, Result};
pub use push_info::{PushInfo, PushInfoStorage};
pub use queue::{DeviceQueue, InFlight, QueueState, QueueStorage, QueuedCommand};
