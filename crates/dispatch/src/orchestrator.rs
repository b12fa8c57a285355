//! Dispatch Orchestrator - client-side batch driver
//!
//! Loads a JSON array of emergencies and drives each one to completion before
//! starting the next: open the monitoring stream, assign, then follow the
//! stream until `Extinguido`. Opening the stream first guarantees no early
//! status update is missed. A failing emergency is logged and the batch
//! carries on.

use firewatch_core::{EmergencyRequest, FireStatus};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};
use tracing::{info, warn};

use crate::grpc::{DispatchClient, Emergency, MonitoringClient, StatusUpdate};

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Batch file could not be read
    #[error("Failed to read batch file {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Batch file is not a JSON array of emergencies
    #[error("Invalid batch file: {0}")]
    Decode(#[from] serde_json::Error),

    /// Could not connect to the node
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A call was rejected or failed
    #[error("Request failed: {0}")]
    Rpc(#[from] tonic::Status),

    /// `Assign` did not answer in time
    #[error("Assignment timed out after {0:?}")]
    Timeout(Duration),

    /// Stream ended before `Extinguido`
    #[error("Status stream for {0} ended before the fire was extinguished")]
    StreamEnded(String),
}

/// Parse a batch from JSON text
pub fn parse_batch(json: &str) -> Result<Vec<EmergencyRequest>, OrchestratorError> {
    Ok(serde_json::from_str(json)?)
}

/// Load a batch from a JSON file
pub fn load_batch<P: AsRef<Path>>(path: P) -> Result<Vec<EmergencyRequest>, OrchestratorError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| OrchestratorError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_batch(&content)
}

/// How one emergency of the batch ended
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencyOutcome {
    /// Fire extinguished by `resource_id`
    Extinguished {
        /// Resource that worked it
        resource_id: String,
        /// Status updates received
        updates: usize,
    },
    /// Nothing was available to send
    NoResourceAvailable,
    /// Assignment or monitoring failed
    Failed(String),
}

/// Per-emergency results of a batch, in batch order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    /// (emergency name, outcome)
    pub outcomes: Vec<(String, EmergencyOutcome)>,
}

impl BatchSummary {
    /// Emergencies that reached `Extinguido`
    pub fn extinguished(&self) -> usize {
        self.count(|o| matches!(o, EmergencyOutcome::Extinguished { .. }))
    }

    /// Emergencies with no resource available
    pub fn unassigned(&self) -> usize {
        self.count(|o| matches!(o, EmergencyOutcome::NoResourceAvailable))
    }

    /// Emergencies that failed
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EmergencyOutcome::Failed(_)))
    }

    fn count(&self, f: impl Fn(&EmergencyOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| f(o)).count()
    }
}

/// Sequential batch driver over the Dispatch and Monitoring services
pub struct Orchestrator {
    dispatch: DispatchClient<Channel>,
    monitoring: MonitoringClient<Channel>,
    assign_timeout: Duration,
}

impl Orchestrator {
    /// Connect to a node
    pub async fn connect(
        endpoint: impl Into<String>,
        assign_timeout: Duration,
    ) -> Result<Self, OrchestratorError> {
        let channel = Endpoint::from_shared(endpoint.into())?.connect().await?;
        Ok(Self::new(channel, assign_timeout))
    }

    /// Use an existing channel
    pub fn new(channel: Channel, assign_timeout: Duration) -> Self {
        Self {
            dispatch: DispatchClient::new(channel.clone()),
            monitoring: MonitoringClient::new(channel),
            assign_timeout,
        }
    }

    /// Drive every emergency in order, reporting each status update
    pub async fn run_batch(
        &mut self,
        batch: &[EmergencyRequest],
        mut on_update: impl FnMut(&StatusUpdate),
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for request in batch {
            info!(
                emergency = %request.name,
                magnitude = request.magnitude,
                location = %request.location,
                "Dispatching emergency"
            );

            let outcome = match self.drive(request, &mut on_update).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(emergency = %request.name, "Emergency failed: {}", e);
                    EmergencyOutcome::Failed(e.to_string())
                }
            };
            summary.outcomes.push((request.name.clone(), outcome));
        }

        info!(
            total = summary.outcomes.len(),
            extinguished = summary.extinguished(),
            unassigned = summary.unassigned(),
            failed = summary.failed(),
            "Batch complete"
        );
        summary
    }

    /// Drive one emergency to completion
    pub async fn drive(
        &mut self,
        request: &EmergencyRequest,
        on_update: &mut impl FnMut(&StatusUpdate),
    ) -> Result<EmergencyOutcome, OrchestratorError> {
        let emergency = Emergency::from(request);

        let mut stream = self
            .monitoring
            .subscribe(emergency.clone())
            .await?
            .into_inner();

        let reply = tokio::time::timeout(self.assign_timeout, self.dispatch.assign(emergency))
            .await
            .map_err(|_| OrchestratorError::Timeout(self.assign_timeout))??
            .into_inner();

        if !reply.assigned {
            info!(emergency = %request.name, "{}", reply.message);
            return Ok(EmergencyOutcome::NoResourceAvailable);
        }
        info!(emergency = %request.name, resource = %reply.resource_id, "{}", reply.message);

        let extinguished = FireStatus::Extinguished.as_str();
        let mut updates = 0;
        while let Some(update) = stream.message().await? {
            updates += 1;
            on_update(&update);

            if update.status == extinguished {
                info!(
                    emergency = %update.emergency_name,
                    resource = %update.resource_id,
                    "Fire extinguished"
                );
                return Ok(EmergencyOutcome::Extinguished {
                    resource_id: update.resource_id,
                    updates,
                });
            }
        }

        Err(OrchestratorError::StreamEnded(request.name.clone()))
    }
}
