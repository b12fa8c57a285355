//! gRPC services for Firewatch dispatch
//!
//! Three services are exposed, all served by the node process:
//! - **Dispatch**: `Assign` reserves the nearest resource and starts execution;
//!   `Resolve` releases in-flight bookkeeping (idempotent).
//! - **Execution**: `Execute` starts an execution for an already reserved
//!   resource and returns immediately.
//! - **Monitoring**: `Subscribe` streams the status updates of one emergency and
//!   ends after its `Extinguido`.
//!
//! Every call is recorded with an `[AUDIT]` log line.

#![warn(missing_docs)]

use firewatch_core::{AssignmentDecision, Coordinate, EmergencyRequest, StatusEvent};
use firewatch_registry::RegistryError;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::engine::{ExecutionEngine, ExecutionError};
use crate::relay::{RelayError, StatusRelay};
use crate::selector::{AssignmentOutcome, DispatchError, Dispatcher};

// Include generated protobuf code
/// Generated protobuf types for the Firewatch dispatch API.
#[allow(missing_docs)]
pub mod proto {
    tonic::include_proto!("firewatch.dispatch");
}

pub use proto::{
    dispatch_client::DispatchClient,
    dispatch_server::{Dispatch, DispatchServer},
    execution_client::ExecutionClient,
    execution_server::{Execution, ExecutionServer},
    monitoring_client::MonitoringClient,
    monitoring_server::{Monitoring, MonitoringServer},
    Assignment, DispatchReply, Emergency, ExecutionReply, StatusUpdate,
};

/// Buffered updates per monitoring stream
const STREAM_BUFFER: usize = 32;

impl From<&EmergencyRequest> for Emergency {
    fn from(request: &EmergencyRequest) -> Self {
        Self {
            name: request.name.clone(),
            latitude: request.location.latitude,
            longitude: request.location.longitude,
            magnitude: i64::from(request.magnitude),
        }
    }
}

impl From<StatusEvent> for StatusUpdate {
    fn from(event: StatusEvent) -> Self {
        Self {
            emergency_name: event.emergency_name,
            status: event.status.as_str().to_string(),
            resource_id: event.resource_id,
        }
    }
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::InvalidRequest(msg) => Status::invalid_argument(msg),
            DispatchError::DuplicateEmergency(name) => {
                Status::already_exists(format!("Emergency {} is already in flight", name))
            }
            DispatchError::Registry(e) => registry_status(e),
            DispatchError::Launch(e) => Status::internal(format!("Execution launch failed: {}", e)),
        }
    }
}

impl From<ExecutionError> for Status {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::Registry(e) => registry_status(e),
            ExecutionError::NotReserved(id) => {
                Status::failed_precondition(format!("Resource {} is not reserved", id))
            }
            e @ ExecutionError::AlreadyRunning(_) | e @ ExecutionError::ResourceEngaged(_) => {
                Status::already_exists(e.to_string())
            }
            ExecutionError::ShutDown => Status::unavailable("Execution engine is shutting down"),
            e @ ExecutionError::Aborted(_) => Status::internal(e.to_string()),
        }
    }
}

impl From<RelayError> for Status {
    fn from(err: RelayError) -> Self {
        Status::unavailable(err.to_string())
    }
}

fn registry_status(err: RegistryError) -> Status {
    match err {
        RegistryError::NotFound(id) => Status::not_found(format!("Resource not found: {}", id)),
        e @ RegistryError::Corrupt { .. } => Status::internal(e.to_string()),
        e => Status::unavailable(e.to_string()),
    }
}

/// Validate and convert a wire emergency
pub fn emergency_from_proto(msg: &Emergency) -> Result<EmergencyRequest, Status> {
    if msg.name.trim().is_empty() {
        return Err(Status::invalid_argument("Emergency name must not be empty"));
    }
    let magnitude = u32::try_from(msg.magnitude).map_err(|_| {
        Status::invalid_argument(format!(
            "Magnitude must be a non-negative 32-bit integer, got {}",
            msg.magnitude
        ))
    })?;

    Ok(EmergencyRequest::new(
        msg.name.clone(),
        Coordinate::new(msg.latitude, msg.longitude),
        magnitude,
    ))
}

/// Audit log helper - structured logging for all operations
fn audit_log<T>(request: &Request<T>, action: &str, target: &str, result: &str) {
    let operator = request
        .remote_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "local".to_string());
    tracing::info!(
        "[AUDIT] Action={} Operator={} Target={} Result={}",
        action,
        operator,
        target,
        result
    );
}

/// Dispatch service implementation
pub struct DispatchService {
    dispatcher: Arc<Dispatcher>,
}

impl DispatchService {
    /// Create a new Dispatch service
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[tonic::async_trait]
impl Dispatch for DispatchService {
    async fn assign(
        &self,
        request: Request<Emergency>,
    ) -> Result<Response<DispatchReply>, Status> {
        let emergency = emergency_from_proto(request.get_ref()).map_err(|status| {
            audit_log(&request, "ASSIGN", &request.get_ref().name, status.message());
            status
        })?;
        let name = emergency.name.clone();

        let outcome = self.dispatcher.assign(emergency).map_err(|e| {
            audit_log(&request, "ASSIGN", &name, &format!("FAILED: {}", e));
            Status::from(e)
        })?;

        let reply = match outcome {
            AssignmentOutcome::Assigned(decision) => {
                audit_log(
                    &request,
                    "ASSIGN",
                    &name,
                    &format!("ASSIGNED {}", decision.resource_id),
                );
                DispatchReply {
                    message: format!(
                        "Resource {} assigned to emergency {}",
                        decision.resource_id, name
                    ),
                    assigned: true,
                    resource_id: decision.resource_id,
                }
            }
            AssignmentOutcome::NoResourceAvailable => {
                audit_log(&request, "ASSIGN", &name, "NO_RESOURCE_AVAILABLE");
                DispatchReply {
                    message: "No resources available".to_string(),
                    assigned: false,
                    resource_id: String::new(),
                }
            }
        };

        Ok(Response::new(reply))
    }

    async fn resolve(
        &self,
        request: Request<Emergency>,
    ) -> Result<Response<DispatchReply>, Status> {
        let name = request.get_ref().name.clone();
        let resource_id = self.dispatcher.assigned_resource(&name).unwrap_or_default();
        let released = self.dispatcher.resolve(&name);

        audit_log(
            &request,
            "RESOLVE",
            &name,
            if released { "RELEASED" } else { "NOOP" },
        );

        Ok(Response::new(DispatchReply {
            message: format!("Emergency {} resolved", name),
            assigned: false,
            resource_id,
        }))
    }
}

/// Execution service implementation
pub struct ExecutionService {
    engine: ExecutionEngine,
}

impl ExecutionService {
    /// Create a new Execution service
    pub fn new(engine: ExecutionEngine) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl Execution for ExecutionService {
    async fn execute(
        &self,
        request: Request<Assignment>,
    ) -> Result<Response<ExecutionReply>, Status> {
        let assignment = request.get_ref();
        let emergency = assignment
            .emergency
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("Assignment is missing its emergency"))
            .and_then(emergency_from_proto)
            .map_err(|status| {
                audit_log(&request, "EXECUTE", &assignment.resource_id, status.message());
                status
            })?;
        let resource_id = assignment.resource_id.clone();
        let name = emergency.name.clone();

        let handle = self
            .engine
            .start(AssignmentDecision::new(emergency, resource_id.clone(), 0.0))
            .map_err(|e| {
                audit_log(&request, "EXECUTE", &resource_id, &format!("FAILED: {}", e));
                Status::from(e)
            })?;

        audit_log(&request, "EXECUTE", &resource_id, &format!("STARTED {}", name));
        Ok(Response::new(ExecutionReply {
            message: format!(
                "Resource {} started emergency {} ({} status updates expected)",
                resource_id,
                name,
                handle.plan().total_events()
            ),
            started: true,
        }))
    }
}

/// Monitoring service implementation
pub struct MonitoringService {
    relay: StatusRelay,
}

impl MonitoringService {
    /// Create a new Monitoring service
    pub fn new(relay: StatusRelay) -> Self {
        Self { relay }
    }
}

#[tonic::async_trait]
impl Monitoring for MonitoringService {
    type SubscribeStream = ReceiverStream<Result<StatusUpdate, Status>>;

    async fn subscribe(
        &self,
        request: Request<Emergency>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let name = request.get_ref().name.clone();
        if name.trim().is_empty() {
            audit_log(&request, "SUBSCRIBE", &name, "INVALID_NAME");
            return Err(Status::invalid_argument("Emergency name must not be empty"));
        }

        // Subscribe before returning so nothing published after this call is missed
        let mut subscription = self.relay.subscribe(&name).map_err(|e| {
            audit_log(&request, "SUBSCRIBE", &name, &format!("FAILED: {}", e));
            Status::from(e)
        })?;
        audit_log(&request, "SUBSCRIBE", &name, "OPENED");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = tx.closed() => break,
                    item = subscription.next() => item,
                };
                let Some(item) = item else { break };

                let message = item.map(StatusUpdate::from).map_err(Status::from);
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!(emergency = %subscription.emergency_name(), "Status stream closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firewatch_core::FireStatus;

    #[test]
    fn test_emergency_from_proto_validates() {
        let valid = Emergency {
            name: "fire1".to_string(),
            latitude: 1,
            longitude: -1,
            magnitude: 3,
        };
        let request = emergency_from_proto(&valid).unwrap();
        assert_eq!(request.location, Coordinate::new(1, -1));
        assert_eq!(request.magnitude, 3);

        let negative = Emergency {
            magnitude: -1,
            ..valid.clone()
        };
        assert_eq!(
            emergency_from_proto(&negative).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );

        let unnamed = Emergency {
            name: String::new(),
            ..valid
        };
        assert_eq!(
            emergency_from_proto(&unnamed).unwrap_err().code(),
            tonic::Code::InvalidArgument
        );
    }

    #[test]
    fn test_error_status_codes() {
        let cases = vec![
            (
                Status::from(DispatchError::DuplicateEmergency("f".into())),
                tonic::Code::AlreadyExists,
            ),
            (
                Status::from(DispatchError::Registry(RegistryError::Unavailable("down".into()))),
                tonic::Code::Unavailable,
            ),
            (
                Status::from(ExecutionError::Registry(RegistryError::NotFound("x".into()))),
                tonic::Code::NotFound,
            ),
            (
                Status::from(ExecutionError::NotReserved("x".into())),
                tonic::Code::FailedPrecondition,
            ),
            (Status::from(ExecutionError::ShutDown), tonic::Code::Unavailable),
        ];

        for (status, code) in cases {
            assert_eq!(status.code(), code, "{}", status.message());
        }
    }

    #[test]
    fn test_status_update_uses_wire_labels() {
        let update = StatusUpdate::from(StatusEvent::new("fire1", FireStatus::EnRoute, "dron01"));
        assert_eq!(update.status, "En camino");
        assert_eq!(update.resource_id, "dron01");
    }
}
