//! Core domain types shared by every Firewatch component.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Planar coordinate in abstract integer units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    /// First axis
    pub latitude: i32,
    /// Second axis
    pub longitude: i32,
}

impl Coordinate {
    /// Create a coordinate
    pub const fn new(latitude: i32, longitude: i32) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Euclidean distance to another coordinate
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        let dlat = f64::from(self.latitude) - f64::from(other.latitude);
        let dlon = f64::from(self.longitude) - f64::from(other.longitude);
        (dlat * dlat + dlon * dlon).sqrt()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.latitude, self.longitude)
    }
}

/// A fire emergency to be dispatched.
///
/// The `name` is the correlation key for the whole pipeline and must be unique
/// among in-flight emergencies. Serialized flat, matching the batch file format:
/// `{"name": "...", "latitude": 1, "longitude": 2, "magnitude": 3}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmergencyRequest {
    /// Correlation key
    pub name: String,
    /// Where the fire is
    #[serde(flatten)]
    pub location: Coordinate,
    /// Fire size; one suppression tick per unit
    pub magnitude: u32,
}

impl EmergencyRequest {
    /// Create a new emergency request
    pub fn new(name: impl Into<String>, location: Coordinate, magnitude: u32) -> Self {
        Self {
            name: name.into(),
            location,
            magnitude,
        }
    }
}

/// Availability of a resource in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Free to take a new emergency
    Available,
    /// Reserved by an in-flight emergency
    Busy,
}

impl ResourceStatus {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Available => "available",
            ResourceStatus::Busy => "busy",
        }
    }

    /// Parse the stored representation
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "available" => Some(ResourceStatus::Available),
            "busy" => Some(ResourceStatus::Busy),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A drone as stored in the resource registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Unique resource identifier
    pub id: String,
    /// Last known position
    #[serde(flatten)]
    pub location: Coordinate,
    /// Current availability
    pub status: ResourceStatus,
}

impl ResourceRecord {
    /// Create a new resource record
    pub fn new(id: impl Into<String>, location: Coordinate, status: ResourceStatus) -> Self {
        Self {
            id: id.into(),
            location,
            status,
        }
    }

    /// Create an available resource
    pub fn available(id: impl Into<String>, location: Coordinate) -> Self {
        Self::new(id, location, ResourceStatus::Available)
    }

    /// Check if the resource can be reserved
    pub fn is_available(&self) -> bool {
        self.status == ResourceStatus::Available
    }
}

/// Result of nearest-resource selection, handed straight to execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentDecision {
    /// Emergency being served
    pub request: EmergencyRequest,
    /// Reserved resource
    pub resource_id: String,
    /// Distance from the resource to the emergency at selection time
    pub distance: f64,
}

impl AssignmentDecision {
    /// Create a new assignment decision
    pub fn new(request: EmergencyRequest, resource_id: impl Into<String>, distance: f64) -> Self {
        Self {
            request,
            resource_id: resource_id.into(),
            distance,
        }
    }

    /// Name of the emergency
    pub fn emergency_name(&self) -> &str {
        &self.request.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_euclidean() {
        let a = Coordinate::new(0, 0);
        let b = Coordinate::new(3, 4);
        assert_eq!(a.distance_to(&b), 5.0);
        assert_eq!(b.distance_to(&a), 5.0);
        assert_eq!(a.distance_to(&a), 0.0);
    }

    #[test]
    fn test_distance_handles_extremes() {
        let a = Coordinate::new(i32::MIN, i32::MIN);
        let b = Coordinate::new(i32::MAX, i32::MAX);
        assert!(a.distance_to(&b).is_finite());
    }

    #[test]
    fn test_emergency_request_batch_format() {
        let json = r#"{"name": "fire1", "latitude": 1, "longitude": 2, "magnitude": 3}"#;
        let request: EmergencyRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.name, "fire1");
        assert_eq!(request.location, Coordinate::new(1, 2));
        assert_eq!(request.magnitude, 3);
    }

    #[test]
    fn test_negative_magnitude_rejected() {
        let json = r#"{"name": "fire1", "latitude": 1, "longitude": 2, "magnitude": -1}"#;
        assert!(serde_json::from_str::<EmergencyRequest>(json).is_err());
    }

    #[test]
    fn test_resource_status_roundtrip_names() {
        assert_eq!(ResourceStatus::parse("available"), Some(ResourceStatus::Available));
        assert_eq!(ResourceStatus::parse("busy"), Some(ResourceStatus::Busy));
        assert_eq!(ResourceStatus::parse("offline"), None);
        assert_eq!(
            serde_json::to_string(&ResourceStatus::Busy).unwrap(),
            "\"busy\""
        );
    }

    #[test]
    fn test_resource_record_availability() {
        let record = ResourceRecord::available("dron01", Coordinate::new(0, 0));
        assert!(record.is_available());

        let busy = ResourceRecord::new("dron02", Coordinate::new(0, 0), ResourceStatus::Busy);
        assert!(!busy.is_available());
    }
}
