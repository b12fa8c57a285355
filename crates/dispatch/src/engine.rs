//! Execution Engine - drone simulation for reserved resources
//!
//! Each started execution is a tokio task driving a small state machine:
//!
//! ```text
//! Reserved -> EnRoute -> Suppressing -> Extinguished
//!     \__________\___________\________-> Cancelled
//! ```
//!
//! Travel takes `travel_factor x distance` time units split into fixed ticks,
//! with an `En camino` event after every full tick. Suppression emits one
//! `Apagando` per unit of magnitude. Completion emits exactly one `Extinguido`,
//! then writes the resource back to the registry (available, at the target),
//! emits the `extinguished` registration milestone and sends the "resolved"
//! notification to the dispatcher.
//!
//! The final registry write is retried with exponential backoff. When every
//! attempt fails the resource is flagged for manual reconciliation; the emitted
//! `Extinguido` and the notification are never withheld.

use firewatch_broadcast::{publish_json, BroadcastChannel};
use firewatch_core::config::{RetryConfig, SimulationConfig};
use firewatch_core::{
    AssignmentDecision, Config, Coordinate, FireStatus, RegistrationEvent, ResourceStatus,
    StatusEvent,
};
use firewatch_registry::{RegistryError, ResourceRegistry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::selector::ExecutionLauncher;

/// Execution errors
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// Registry lookup failed
    #[error("Registry failure: {0}")]
    Registry(#[from] RegistryError),

    /// Resource exists but was never reserved
    #[error("Resource {0} is not reserved")]
    NotReserved(String),

    /// An execution for this emergency is already running
    #[error("Emergency {0} is already executing")]
    AlreadyRunning(String),

    /// The resource is already working another emergency
    #[error("Resource {0} is already executing another emergency")]
    ResourceEngaged(String),

    /// Engine no longer accepts work
    #[error("Execution engine is shut down")]
    ShutDown,

    /// Task ended without producing a report
    #[error("Execution of {0} ended without a report")]
    Aborted(String),
}

/// Execution lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Resource reserved, execution not yet moving
    Reserved,
    /// Travelling to the emergency
    EnRoute,
    /// Putting the fire out
    Suppressing,
    /// Fire out, resource released
    Extinguished,
    /// Stopped before completion
    Cancelled,
}

impl ExecutionState {
    /// Check if state is terminal (extinguished or cancelled)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Extinguished | ExecutionState::Cancelled
        )
    }

    /// Check if transition to new state is valid
    pub fn can_transition_to(&self, new_state: ExecutionState) -> bool {
        match (self, new_state) {
            (ExecutionState::Reserved, ExecutionState::EnRoute) => true,
            (ExecutionState::EnRoute, ExecutionState::Suppressing) => true,
            (ExecutionState::Suppressing, ExecutionState::Extinguished) => true,
            // Terminal states cannot transition
            (ExecutionState::Extinguished, _) => false,
            (ExecutionState::Cancelled, _) => false,
            // Any live state can be cancelled
            (_, ExecutionState::Cancelled) => true,
            _ => false,
        }
    }
}

/// Bounded exponential backoff for the final registry write.
///
/// The delay before retry `n` (0-indexed) is `first x factor^n`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before the first retry
    pub first: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Multiplicative growth factor
    pub factor: f64,
}

impl RetryPolicy {
    /// Build from the `[retry]` configuration section
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            first: Duration::from_millis(config.first_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            factor: config.factor,
        }
    }

    /// Delay to wait after failed attempt `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Tick counts and tick lengths of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationPlan {
    /// Number of `En camino` events
    pub en_route_ticks: u64,
    /// Number of `Apagando` events
    pub suppression_ticks: u64,
    /// Wall-clock length of one travel tick
    pub travel_tick: Duration,
    /// Wall-clock length of one suppression tick
    pub suppression_tick: Duration,
}

impl SimulationPlan {
    /// Plan an execution covering `distance` for a fire of `magnitude`
    pub fn new(distance: f64, magnitude: u32, config: &SimulationConfig) -> Self {
        let travel_units = (config.travel_factor * distance).floor();
        let travel_units = if travel_units.is_finite() && travel_units > 0.0 {
            travel_units as u64
        } else {
            0
        };
        let tick_units = config.travel_tick_units.max(1);

        Self {
            en_route_ticks: travel_units / tick_units,
            suppression_ticks: u64::from(magnitude),
            travel_tick: Duration::from_millis(config.time_unit_ms.saturating_mul(tick_units)),
            suppression_tick: Duration::from_millis(
                config
                    .time_unit_ms
                    .saturating_mul(config.suppression_tick_units),
            ),
        }
    }

    /// Status events one uninterrupted execution publishes
    pub fn total_events(&self) -> u64 {
        self.en_route_ticks + self.suppression_ticks + 1
    }

    /// Wall-clock time from start to `Extinguido`
    pub fn duration(&self) -> Duration {
        let travel = self
            .travel_tick
            .saturating_mul(u32::try_from(self.en_route_ticks).unwrap_or(u32::MAX));
        let suppression = self
            .suppression_tick
            .saturating_mul(u32::try_from(self.suppression_ticks).unwrap_or(u32::MAX));
        travel.saturating_add(suppression)
    }
}

/// Directed "resolved" message from an execution to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Emergency that finished
    pub emergency_name: String,
    /// Resource that worked it
    pub resource_id: String,
}

/// Receiver side of the completion edge
pub trait ResolutionNotifier: Send + Sync {
    /// Deliver a resolution. At most once, never blocks, never fails the caller.
    fn notify(&self, resolution: Resolution);
}

/// [`ResolutionNotifier`] backed by a bounded mpsc channel
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Resolution>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiver the dispatcher listens on
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Resolution>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl ResolutionNotifier for ChannelNotifier {
    fn notify(&self, resolution: Resolution) {
        match self.tx.try_send(resolution) {
            Ok(()) => {}
            Err(TrySendError::Full(r)) => warn!(
                emergency = %r.emergency_name,
                resource = %r.resource_id,
                "Resolution queue full, notification dropped"
            ),
            Err(TrySendError::Closed(r)) => debug!(
                emergency = %r.emergency_name,
                "Resolution receiver gone, notification dropped"
            ),
        }
    }
}

/// Outcome of one execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    /// Emergency served
    pub emergency_name: String,
    /// Resource used
    pub resource_id: String,
    /// State the execution ended in
    pub final_state: ExecutionState,
    /// Status events successfully handed to the broadcast channel
    pub events_published: u64,
    /// Whether the releasing registry write went through
    pub registry_updated: bool,
}

/// Caller's view of a started execution
#[derive(Debug)]
pub struct ExecutionHandle {
    emergency_name: String,
    resource_id: String,
    plan: SimulationPlan,
    token: CancellationToken,
    report: oneshot::Receiver<ExecutionReport>,
}

impl ExecutionHandle {
    /// Emergency being executed
    pub fn emergency_name(&self) -> &str {
        &self.emergency_name
    }

    /// Resource doing the work
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Plan computed at start
    pub fn plan(&self) -> SimulationPlan {
        self.plan
    }

    /// Stop the execution at the next tick boundary
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the execution to finish
    pub async fn wait(self) -> Result<ExecutionReport, ExecutionError> {
        let Self {
            report,
            emergency_name,
            ..
        } = self;
        report
            .await
            .map_err(|_| ExecutionError::Aborted(emergency_name))
    }
}

/// Mutable progress of one execution
struct Execution {
    decision: AssignmentDecision,
    state: ExecutionState,
    events_published: u64,
}

impl Execution {
    fn new(decision: AssignmentDecision) -> Self {
        Self {
            decision,
            state: ExecutionState::Reserved,
            events_published: 0,
        }
    }

    fn name(&self) -> &str {
        &self.decision.request.name
    }

    fn resource_id(&self) -> &str {
        &self.decision.resource_id
    }

    fn advance(&mut self, to: ExecutionState) {
        if !self.state.can_transition_to(to) {
            warn!(
                emergency = %self.name(),
                from = ?self.state,
                to = ?to,
                "Ignoring invalid execution transition"
            );
            return;
        }
        debug!(emergency = %self.name(), from = ?self.state, to = ?to, "Execution transition");
        self.state = to;
    }

    fn into_report(self, registry_updated: bool) -> ExecutionReport {
        ExecutionReport {
            emergency_name: self.decision.request.name,
            resource_id: self.decision.resource_id,
            final_state: self.state,
            events_published: self.events_published,
            registry_updated,
        }
    }
}

struct RunningExecution {
    id: u64,
    resource_id: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct EngineShared {
    registry: Arc<dyn ResourceRegistry>,
    broadcast: Arc<dyn BroadcastChannel>,
    notifier: Arc<dyn ResolutionNotifier>,
    simulation: SimulationConfig,
    retry: RetryPolicy,
    status_topic: String,
    registration_topic: String,
    running: Mutex<HashMap<String, RunningExecution>>,
    reconciliation: Mutex<BTreeSet<String>>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

/// Runs drone executions for reserved resources
#[derive(Clone)]
pub struct ExecutionEngine {
    shared: Arc<EngineShared>,
}

impl ExecutionEngine {
    /// Create an engine using the simulation, retry and topic settings of `config`
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        broadcast: Arc<dyn BroadcastChannel>,
        notifier: Arc<dyn ResolutionNotifier>,
        config: &Config,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                registry,
                broadcast,
                notifier,
                simulation: config.simulation.clone(),
                retry: RetryPolicy::from_config(&config.retry),
                status_topic: config.broadcast.status_topic.clone(),
                registration_topic: config.broadcast.registration_topic.clone(),
                running: Mutex::new(HashMap::new()),
                reconciliation: Mutex::new(BTreeSet::new()),
                shutdown: CancellationToken::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Start executing a decision and return immediately.
    ///
    /// The resource must exist and be `busy`. Its current location is read from
    /// the registry and used as the travel origin.
    pub fn start(&self, decision: AssignmentDecision) -> Result<ExecutionHandle, ExecutionError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(ExecutionError::ShutDown);
        }

        let resource = shared.registry.find_by_id(&decision.resource_id)?;
        if resource.status != ResourceStatus::Busy {
            return Err(ExecutionError::NotReserved(resource.id));
        }

        let name = decision.request.name.clone();
        let resource_id = decision.resource_id.clone();
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        let token = shared.shutdown.child_token();

        {
            let mut running = shared.running();
            if running.contains_key(&name) {
                return Err(ExecutionError::AlreadyRunning(name));
            }
            if running.values().any(|r| r.resource_id == resource_id) {
                return Err(ExecutionError::ResourceEngaged(resource_id));
            }
            running.insert(
                name.clone(),
                RunningExecution {
                    id,
                    resource_id: resource_id.clone(),
                    token: token.clone(),
                    task: None,
                },
            );
        }

        let origin = resource.location;
        let distance = origin.distance_to(&decision.request.location);
        let plan = SimulationPlan::new(distance, decision.request.magnitude, &shared.simulation);

        info!(
            emergency = %name,
            resource = %resource_id,
            distance,
            en_route_ticks = plan.en_route_ticks,
            suppression_ticks = plan.suppression_ticks,
            "Execution started"
        );

        let (report_tx, report_rx) = oneshot::channel();
        let task_shared = Arc::clone(shared);
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            let report = task_shared.run(decision, origin, plan, task_token).await;
            task_shared.finish(&report.emergency_name, id);
            // Receiver may have been dropped by a fire-and-forget launcher
            let _ = report_tx.send(report);
        });

        if let Some(entry) = shared.running().get_mut(&name) {
            if entry.id == id {
                entry.task = Some(task);
            }
        }

        Ok(ExecutionHandle {
            emergency_name: name,
            resource_id,
            plan,
            token,
            report: report_rx,
        })
    }

    /// Cancel a running execution by emergency name
    pub fn cancel(&self, emergency_name: &str) -> bool {
        match self.shared.running().get(emergency_name) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Check if an execution for this emergency is running
    pub fn is_running(&self, emergency_name: &str) -> bool {
        self.shared.running().contains_key(emergency_name)
    }

    /// Number of running executions
    pub fn active_executions(&self) -> usize {
        self.shared.running().len()
    }

    /// Resources whose releasing write failed on every attempt
    pub fn pending_reconciliation(&self) -> Vec<String> {
        self.shared.reconciliation().iter().cloned().collect()
    }

    /// Clear the reconciliation flag of a resource
    pub fn mark_reconciled(&self, resource_id: &str) -> bool {
        self.shared.reconciliation().remove(resource_id)
    }

    /// Cancel every running execution and wait for the tasks to wind down.
    ///
    /// The engine rejects new work afterwards.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .shared
            .running()
            .values_mut()
            .filter_map(|entry| entry.task.take())
            .collect();

        info!(executions = tasks.len(), "Execution engine shutting down");
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Execution task failed during shutdown: {}", e);
            }
        }
    }
}

impl ExecutionLauncher for ExecutionEngine {
    fn launch(&self, decision: AssignmentDecision) -> Result<(), ExecutionError> {
        self.start(decision).map(|_| ())
    }
}

impl EngineShared {
    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningExecution>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reconciliation(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.reconciliation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn finish(&self, emergency_name: &str, id: u64) {
        let mut running = self.running();
        if running.get(emergency_name).map(|e| e.id) == Some(id) {
            running.remove(emergency_name);
        }
    }

    async fn run(
        &self,
        decision: AssignmentDecision,
        origin: Coordinate,
        plan: SimulationPlan,
        token: CancellationToken,
    ) -> ExecutionReport {
        let mut execution = Execution::new(decision);
        execution.advance(ExecutionState::EnRoute);

        for _ in 0..plan.en_route_ticks {
            if !tick(plan.travel_tick, &token).await {
                return self.cancelled(execution, origin);
            }
            self.publish_status(&mut execution, FireStatus::EnRoute);
        }

        execution.advance(ExecutionState::Suppressing);
        for _ in 0..plan.suppression_ticks {
            if !tick(plan.suppression_tick, &token).await {
                return self.cancelled(execution, origin);
            }
            self.publish_status(&mut execution, FireStatus::Suppressing);
        }

        execution.advance(ExecutionState::Extinguished);
        self.publish_status(&mut execution, FireStatus::Extinguished);

        let target = execution.decision.request.location;
        let registry_updated = self.release_at(execution.resource_id(), target).await;

        self.publish_registration(&RegistrationEvent::extinguished(
            execution.name(),
            execution.resource_id(),
        ));
        self.notifier.notify(Resolution {
            emergency_name: execution.name().to_string(),
            resource_id: execution.resource_id().to_string(),
        });

        info!(
            emergency = %execution.name(),
            resource = %execution.resource_id(),
            location = %target,
            registry_updated,
            "Execution complete"
        );
        execution.into_report(registry_updated)
    }

    fn cancelled(&self, mut execution: Execution, origin: Coordinate) -> ExecutionReport {
        execution.advance(ExecutionState::Cancelled);

        // Location is left where the resource started
        let released = match self
            .registry
            .update_status(execution.resource_id(), ResourceStatus::Available)
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    resource = %execution.resource_id(),
                    "Failed to release cancelled resource: {}", e
                );
                false
            }
        };

        self.notifier.notify(Resolution {
            emergency_name: execution.name().to_string(),
            resource_id: execution.resource_id().to_string(),
        });

        warn!(
            emergency = %execution.name(),
            resource = %execution.resource_id(),
            location = %origin,
            released,
            "Execution cancelled"
        );
        execution.into_report(released)
    }

    fn publish_status(&self, execution: &mut Execution, status: FireStatus) {
        let event = StatusEvent::new(execution.name(), status, execution.resource_id());
        match publish_json(self.broadcast.as_ref(), &self.status_topic, &event) {
            Ok(receivers) => {
                execution.events_published += 1;
                debug!(
                    emergency = %event.emergency_name,
                    resource = %event.resource_id,
                    status = %status,
                    receivers,
                    "Status published"
                );
            }
            Err(e) => warn!(
                emergency = %event.emergency_name,
                status = %status,
                "Failed to publish status: {}", e
            ),
        }
    }

    fn publish_registration(&self, event: &RegistrationEvent) {
        if let Err(e) = publish_json(self.broadcast.as_ref(), &self.registration_topic, event) {
            warn!(emergency = %event.name(), "Failed to publish registration event: {}", e);
        }
    }

    /// Write `available` at `target`, retrying with backoff
    async fn release_at(&self, resource_id: &str, target: Coordinate) -> bool {
        for attempt in 0..self.retry.attempts {
            match self.registry.update_location_and_status(
                resource_id,
                target,
                ResourceStatus::Available,
            ) {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        resource = %resource_id,
                        attempt = attempt + 1,
                        attempts = self.retry.attempts,
                        "Registry release failed: {}", e
                    );
                    if attempt + 1 < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay(attempt)).await;
                    }
                }
            }
        }

        error!(
            resource = %resource_id,
            location = %target,
            "Registry release exhausted retries, resource flagged for reconciliation"
        );
        self.reconciliation().insert(resource_id.to_string());
        false
    }
}

/// Sleep one tick; false when cancelled first
async fn tick(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
