//! Core functionality for the Firewatch emergency dispatch system.
//!
//! This crate provides the domain types, event payloads, configuration and
//! logging shared by the registry, broadcast, dispatch and service crates.

pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod types;

pub use config::{Config, LogFormat, RegistryBackend};
pub use error::{Error, Result};
pub use event::{FireStatus, RegistrationEvent, StatusEvent, REGISTRATION_TOPIC, STATUS_TOPIC};
pub use types::{AssignmentDecision, Coordinate, EmergencyRequest, ResourceRecord, ResourceStatus};

/// Current Unix time in nanoseconds
pub fn current_timestamp_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
