//! Core types for FleetMDM.
//!
//! This crate defines the message shapes, bus envelopes, event bus and error
//! type shared by the device, command and server crates.

pub mod checkin;
pub mod codec;
pub mod config;
pub mod connect;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod waker;

pub use error::{Error, Result};

// Message exports
pub use checkin::{decode_checkin, Authenticate, CheckOut, CheckinMessage, TokenUpdate};
pub use connect::{decode_connect, ConnectResponse, ErrorChainItem, Status};

// Event exports
pub use event::{topics, CheckinEvent, ConnectEvent, Event};

// Event bus exports
pub use eventbus::{
    BackpressurePolicy, BusStats, EventBus, EventBusConfig, Subscription, SubscriptionStats,
};

pub use waker::{DeviceWaker, NoopWaker};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::env_vars;
    pub use crate::error::{Error, Result};

    pub use crate::checkin::{CheckinMessage, TokenUpdate};
    pub use crate::connect::{ConnectResponse, Status};

    pub use crate::event::{topics, CheckinEvent, ConnectEvent, Event};
    pub use crate::eventbus::{EventBus, Subscription};

    pub use crate::waker::DeviceWaker;
}
