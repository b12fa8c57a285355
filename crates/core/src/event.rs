//! Event payloads carried on the broadcast channel.
//!
//! Two independent streams exist:
//! - **Status events** (`status-events`): one per execution tick, consumed by the
//!   status relay and forwarded to observers.
//! - **Registration events** (`registration-events`): lifecycle milestones for
//!   the external audit ledger. Dropping them never affects dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::EmergencyRequest;

/// Default topic for per-tick status events
pub const STATUS_TOPIC: &str = "status-events";

/// Default topic for lifecycle registration events
pub const REGISTRATION_TOPIC: &str = "registration-events";

/// Phase reported by a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FireStatus {
    /// Resource travelling to the emergency
    #[serde(rename = "En camino")]
    EnRoute,
    /// Resource suppressing the fire
    #[serde(rename = "Apagando")]
    Suppressing,
    /// Fire is out; terminal for the emergency
    #[serde(rename = "Extinguido")]
    Extinguished,
}

impl FireStatus {
    /// Wire label
    pub fn as_str(&self) -> &'static str {
        match self {
            FireStatus::EnRoute => "En camino",
            FireStatus::Suppressing => "Apagando",
            FireStatus::Extinguished => "Extinguido",
        }
    }

    /// Parse a wire label
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "En camino" => Some(FireStatus::EnRoute),
            "Apagando" => Some(FireStatus::Suppressing),
            "Extinguido" => Some(FireStatus::Extinguished),
            _ => None,
        }
    }

    /// Check if this status ends a subscription
    pub fn is_terminal(&self) -> bool {
        matches!(self, FireStatus::Extinguished)
    }
}

impl fmt::Display for FireStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live status of one emergency, published once per phase tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Correlation key
    pub emergency_name: String,
    /// Current phase
    pub status: FireStatus,
    /// Resource working the emergency
    pub resource_id: String,
}

impl StatusEvent {
    /// Create a new status event
    pub fn new(
        emergency_name: impl Into<String>,
        status: FireStatus,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            emergency_name: emergency_name.into(),
            status,
            resource_id: resource_id.into(),
        }
    }

    /// Check if this is the terminal event
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Lifecycle milestone sent to the registration topic.
///
/// Tagged by the `status` field: `"En curso"` for an assignment,
/// `"Extinguido"` for completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum RegistrationEvent {
    /// Emergency assigned to a resource
    #[serde(rename = "En curso")]
    Assigned {
        /// Unique numeric identifier (Unix nanoseconds at assignment)
        emergency_id: u64,
        /// Correlation key
        name: String,
        /// Emergency position, first axis
        latitude: i32,
        /// Emergency position, second axis
        longitude: i32,
        /// Fire size
        magnitude: u32,
        /// Assigned resource
        resource_id: String,
    },
    /// Emergency extinguished
    #[serde(rename = "Extinguido")]
    Extinguished {
        /// Correlation key
        name: String,
        /// Resource that put the fire out
        resource_id: String,
    },
}

impl RegistrationEvent {
    /// Build an assignment milestone
    pub fn assigned(emergency_id: u64, request: &EmergencyRequest, resource_id: &str) -> Self {
        RegistrationEvent::Assigned {
            emergency_id,
            name: request.name.clone(),
            latitude: request.location.latitude,
            longitude: request.location.longitude,
            magnitude: request.magnitude,
            resource_id: resource_id.to_string(),
        }
    }

    /// Build a completion milestone
    pub fn extinguished(name: &str, resource_id: &str) -> Self {
        RegistrationEvent::Extinguished {
            name: name.to_string(),
            resource_id: resource_id.to_string(),
        }
    }

    /// Emergency name this milestone refers to
    pub fn name(&self) -> &str {
        match self {
            RegistrationEvent::Assigned { name, .. } => name,
            RegistrationEvent::Extinguished { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Coordinate;

    #[test]
    fn test_fire_status_wire_labels() {
        assert_eq!(
            serde_json::to_string(&FireStatus::EnRoute).unwrap(),
            "\"En camino\""
        );
        assert_eq!(FireStatus::parse("Apagando"), Some(FireStatus::Suppressing));
        assert_eq!(FireStatus::parse("Ardiendo"), None);
        assert!(FireStatus::Extinguished.is_terminal());
        assert!(!FireStatus::Suppressing.is_terminal());
    }

    #[test]
    fn test_status_event_json_shape() {
        let event = StatusEvent::new("fire1", FireStatus::Suppressing, "dron01");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["emergency_name"], "fire1");
        assert_eq!(value["status"], "Apagando");
        assert_eq!(value["resource_id"], "dron01");
    }

    #[test]
    fn test_registration_assigned_is_flat() {
        let request = EmergencyRequest::new("fire1", Coordinate::new(4, -2), 3);
        let event = RegistrationEvent::assigned(42, &request, "dron01");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["status"], "En curso");
        assert_eq!(value["emergency_id"], 42);
        assert_eq!(value["latitude"], 4);
        assert_eq!(value["longitude"], -2);
        assert_eq!(value["magnitude"], 3);
    }

    #[test]
    fn test_registration_extinguished_parses() {
        let json = r#"{"status": "Extinguido", "name": "fire1", "resource_id": "dron01"}"#;
        let event: RegistrationEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event, RegistrationEvent::extinguished("fire1", "dron01"));
        assert_eq!(event.name(), "fire1");
    }
}
