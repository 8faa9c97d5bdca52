//! FleetMDM device services.
//!
//! ## Architecture
//!
//! - **CheckinService**: decodes check-ins and publishes them on the bus
//! - **DeviceStore**: consumes check-ins, keeps one record per UDID
//! - **PushInfoStore**: consumes TokenUpdate, keeps push credentials per UDID
//! - **PushTrigger**: wakes a device through a [`PushSender`]; also the
//!   command queue's [`fleetmdm_core::DeviceWaker`]

pub mod checkin;
pub mod push;
pub mod push_info;
pub mod store;

pub use checkin::CheckinService;
pub use push::{validate_token, wake_payload, LoggingPushSender, PushSender, PushTrigger};
pub use push_info::PushInfoStore;
pub use store::DeviceStore;
