//! Dispatch - nearest-resource assignment, drone execution and status streaming
//!
//! The dispatcher reserves the closest available resource for an emergency
//! and hands it to the execution engine, which simulates travel and
//! suppression while publishing status updates on the shared broadcast
//! channel. The relay filters those updates per emergency for the Monitoring
//! service, and the ledger keeps a registration record of each emergency.

#![warn(missing_docs)]

pub mod engine;
pub mod grpc;
pub mod ledger;
pub mod node;
pub mod orchestrator;
pub mod relay;
pub mod selector;

pub use engine::{
    ChannelNotifier, ExecutionEngine, ExecutionError, ExecutionHandle, ExecutionReport,
    ExecutionState, Resolution, ResolutionNotifier, RetryPolicy, SimulationPlan,
};
pub use ledger::{EmergencyEntry, EmergencyLedger, LedgerConsumer, LedgerError};
pub use node::{FirewatchNode, NodeError};
pub use orchestrator::{
    load_batch, parse_batch, BatchSummary, EmergencyOutcome, Orchestrator, OrchestratorError,
};
pub use relay::{RelayError, StatusRelay, StatusSubscription};
pub use selector::{
    select_nearest, AssignmentOutcome, DispatchError, Dispatcher, ExecutionLauncher,
};
