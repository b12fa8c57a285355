//! Dispatch Selector - nearest available resource selection and reservation
//!
//! `assign` scans the registry for available resources, picks the one with the
//! strictly smallest Euclidean distance (first seen wins ties; scans are ordered
//! by id) and reserves it with the registry's atomic compare-and-set. A lost
//! race triggers a bounded rescan. The decision is then handed to the
//! [`ExecutionLauncher`]; if that fails the reservation is rolled back.
//!
//! The dispatcher also owns the in-flight table keyed by emergency name. Entries
//! are released by `resolve`, either called directly or driven by the
//! resolution listener fed from the execution engine.

use firewatch_broadcast::{publish_json, BroadcastChannel};
use firewatch_core::{
    current_timestamp_ns, AssignmentDecision, Coordinate, EmergencyRequest, RegistrationEvent,
    ResourceRecord, ResourceStatus,
};
use firewatch_registry::{RegistryError, ResourceRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{ExecutionError, Resolution};

/// Default number of scan-and-reserve rounds before giving up
pub const DEFAULT_RESERVE_ATTEMPTS: usize = 3;

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Request failed validation
    #[error("Invalid emergency: {0}")]
    InvalidRequest(String),

    /// An emergency with this name is already in flight
    #[error("Emergency {0} is already in flight")]
    DuplicateEmergency(String),

    /// Registry could not be read or updated
    #[error("Registry failure: {0}")]
    Registry(#[from] RegistryError),

    /// Execution could not be started; the reservation was rolled back
    #[error("Execution launch failed: {0}")]
    Launch(#[from] ExecutionError),
}

/// Starts execution of an assignment decision
pub trait ExecutionLauncher: Send + Sync {
    /// Begin executing; must return without waiting for completion
    fn launch(&self, decision: AssignmentDecision) -> Result<(), ExecutionError>;
}

/// Result of an assignment attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AssignmentOutcome {
    /// A resource was reserved and execution started
    Assigned(AssignmentDecision),
    /// Nothing available; no record was touched
    NoResourceAvailable,
}

impl AssignmentOutcome {
    /// Check if a resource was assigned
    pub fn is_assigned(&self) -> bool {
        matches!(self, AssignmentOutcome::Assigned(_))
    }

    /// Assigned resource, if any
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            AssignmentOutcome::Assigned(decision) => Some(&decision.resource_id),
            AssignmentOutcome::NoResourceAvailable => None,
        }
    }
}

/// Pick the candidate strictly nearest to `target`.
///
/// On equal distances the earlier candidate is kept.
pub fn select_nearest<'a>(
    candidates: &'a [ResourceRecord],
    target: &Coordinate,
) -> Option<(&'a ResourceRecord, f64)> {
    let mut best: Option<(&ResourceRecord, f64)> = None;
    for candidate in candidates {
        let distance = candidate.location.distance_to(target);
        if best.map_or(true, |(_, min)| distance < min) {
            best = Some((candidate, distance));
        }
    }
    best
}

/// Check an incoming request before it touches the registry
pub fn validate_request(request: &EmergencyRequest) -> Result<(), DispatchError> {
    if request.name.trim().is_empty() {
        return Err(DispatchError::InvalidRequest(
            "emergency name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Nearest-resource dispatcher
pub struct Dispatcher {
    registry: Arc<dyn ResourceRegistry>,
    broadcast: Arc<dyn BroadcastChannel>,
    launcher: Arc<dyn ExecutionLauncher>,
    registration_topic: String,
    reserve_attempts: usize,
    /// Emergency name -> reserved resource (None while selection is running)
    in_flight: Mutex<HashMap<String, Option<String>>>,
}

impl Dispatcher {
    /// Create a new dispatcher
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        broadcast: Arc<dyn BroadcastChannel>,
        launcher: Arc<dyn ExecutionLauncher>,
        registration_topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            broadcast,
            launcher,
            registration_topic: registration_topic.into(),
            reserve_attempts: DEFAULT_RESERVE_ATTEMPTS,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Override the number of scan-and-reserve rounds
    pub fn with_reserve_attempts(mut self, attempts: usize) -> Self {
        self.reserve_attempts = attempts.max(1);
        self
    }

    /// Assign the nearest available resource to an emergency and start execution
    pub fn assign(&self, request: EmergencyRequest) -> Result<AssignmentOutcome, DispatchError> {
        validate_request(&request)?;
        self.claim(&request.name)?;

        let decision = match self.reserve_nearest(&request) {
            Ok(Some(decision)) => decision,
            Ok(None) => {
                self.release(&request.name);
                info!(emergency = %request.name, "No resource available");
                return Ok(AssignmentOutcome::NoResourceAvailable);
            }
            Err(e) => {
                self.release(&request.name);
                error!(emergency = %request.name, "Resource selection failed: {}", e);
                return Err(e);
            }
        };

        if let Some(entry) = self.in_flight().get_mut(&request.name) {
            *entry = Some(decision.resource_id.clone());
        }

        if let Err(e) = self.launcher.launch(decision.clone()) {
            self.rollback(&decision);
            self.release(&request.name);
            return Err(DispatchError::Launch(e));
        }

        let event = RegistrationEvent::assigned(
            current_timestamp_ns(),
            &decision.request,
            &decision.resource_id,
        );
        if let Err(e) = publish_json(self.broadcast.as_ref(), &self.registration_topic, &event) {
            warn!(emergency = %request.name, "Failed to publish registration event: {}", e);
        }

        info!(
            emergency = %request.name,
            resource = %decision.resource_id,
            distance = decision.distance,
            "Emergency assigned"
        );
        Ok(AssignmentOutcome::Assigned(decision))
    }

    /// Release the in-flight entry of an emergency.
    ///
    /// Returns whether an entry existed; unknown names are a no-op.
    pub fn resolve(&self, emergency_name: &str) -> bool {
        let released = self.release(emergency_name);
        if released {
            info!(emergency = %emergency_name, "Emergency resolved");
        } else {
            debug!(emergency = %emergency_name, "Resolve for unknown emergency ignored");
        }
        released
    }

    /// Check if an emergency is in flight
    pub fn is_in_flight(&self, emergency_name: &str) -> bool {
        self.in_flight().contains_key(emergency_name)
    }

    /// Resource reserved for an in-flight emergency
    pub fn assigned_resource(&self, emergency_name: &str) -> Option<String> {
        self.in_flight().get(emergency_name).cloned().flatten()
    }

    /// Number of emergencies in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight().len()
    }

    /// Consume resolutions from the execution engine until shutdown
    pub fn spawn_resolution_listener(
        self: &Arc<Self>,
        mut resolutions: mpsc::Receiver<Resolution>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = resolutions.recv() => match message {
                        Some(resolution) => {
                            dispatcher.resolve(&resolution.emergency_name);
                        }
                        None => break,
                    },
                }
            }
            debug!("Resolution listener stopped");
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claim(&self, emergency_name: &str) -> Result<(), DispatchError> {
        let mut in_flight = self.in_flight();
        if in_flight.contains_key(emergency_name) {
            warn!(emergency = %emergency_name, "Duplicate emergency rejected");
            return Err(DispatchError::DuplicateEmergency(
                emergency_name.to_string(),
            ));
        }
        in_flight.insert(emergency_name.to_string(), None);
        Ok(())
    }

    fn release(&self, emergency_name: &str) -> bool {
        self.in_flight().remove(emergency_name).is_some()
    }

    fn reserve_nearest(
        &self,
        request: &EmergencyRequest,
    ) -> Result<Option<AssignmentDecision>, DispatchError> {
        for attempt in 1..=self.reserve_attempts {
            let candidates = self.registry.find_available()?;
            let Some((nearest, distance)) = select_nearest(&candidates, &request.location) else {
                return Ok(None);
            };

            if self.registry.try_reserve(&nearest.id)? {
                return Ok(Some(AssignmentDecision::new(
                    request.clone(),
                    nearest.id.clone(),
                    distance,
                )));
            }

            debug!(
                emergency = %request.name,
                resource = %nearest.id,
                attempt,
                "Reservation lost, rescanning"
            );
        }

        warn!(
            emergency = %request.name,
            attempts = self.reserve_attempts,
            "Every reservation attempt lost a race"
        );
        Ok(None)
    }

    fn rollback(&self, decision: &AssignmentDecision) {
        match self
            .registry
            .update_status(&decision.resource_id, ResourceStatus::Available)
        {
            Ok(()) => warn!(
                emergency = %decision.request.name,
                resource = %decision.resource_id,
                "Launch failed, reservation rolled back"
            ),
            Err(e) => error!(
                emergency = %decision.request.name,
                resource = %decision.resource_id,
                "Launch failed and rollback failed: {}", e
            ),
        }
    }
}
