//! Shared configuration defaults.
//!
//! Default values and environment variable names used across crates, kept in
//! one place so the server config loader and the library constructors agree.

/// Event bus defaults.
pub mod bus {
    /// Bounded queue length for each subscription.
    pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;
    /// How long the dispatcher waits on a full subscription under the
    /// blocking policy before dropping the event for that subscriber.
    pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
    /// Upper bound on live subscriptions per bus.
    pub const MAX_SUBSCRIPTIONS: usize = 4096;
}

/// Command queue defaults.
pub mod queue {
    /// An in-flight command is offered again on Idle after this many seconds
    /// without an outcome.
    pub const DEFAULT_REDELIVER_AFTER_SECS: u64 = 300;
}

/// Storage defaults.
pub mod storage {
    pub const DEFAULT_DB_PATH: &str = "data/fleetmdm.redb";
}

/// Push defaults.
pub mod push {
    /// Upper bound on a raw device token length, in bytes.
    pub const MAX_TOKEN_LEN: usize = 100;
}

/// Environment variable names.
pub mod env_vars {
    pub const CONFIG_PATH: &str = "FLEETMDM_CONFIG";
    pub const DB_PATH: &str = "FLEETMDM_DB_PATH";
    pub const BUS_SUBSCRIBER_CAPACITY: &str = "FLEETMDM_BUS_SUBSCRIBER_CAPACITY";
    pub const BUS_BACKPRESSURE: &str = "FLEETMDM_BUS_BACKPRESSURE";
    pub const BUS_SEND_TIMEOUT_MS: &str = "FLEETMDM_BUS_SEND_TIMEOUT_MS";
    pub const QUEUE_REDELIVER_AFTER_SECS: &str = "FLEETMDM_QUEUE_REDELIVER_AFTER_SECS";
    pub const PUSH_TOPIC: &str = "FLEETMDM_PUSH_TOPIC";
    pub const LOG_JSON: &str = "FLEETMDM_LOG_JSON";

    /// Read and parse an environment variable, returning `None` when it is
    /// unset or does not parse.
    pub fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }
}
