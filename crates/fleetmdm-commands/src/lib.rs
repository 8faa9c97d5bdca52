//! Command system for managed devices.
//!
//! Provides:
//! - Command payloads, one variant per request type, with their wire codec
//! - The command service that publishes new commands
//! - Persisted per-device queues and the connect/acknowledge state machine

pub mod ack;
pub mod command;
pub mod events;
pub mod queue;
pub mod service;

// Re-exports
pub use command::{
    Command, CommandId, CommandPayload, CommandRequest, DeviceInformation, DeviceLock,
    EraseDevice, InstallApplication, InstallProfile, InstalledApplicationList, RemoveProfile,
};

pub use ack::Exchange;
pub use events::CommandEvent;
pub use queue::{CommandQueue, QueueConfig};
pub use service::CommandService;
