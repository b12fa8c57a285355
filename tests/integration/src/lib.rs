//! Integration tests for the Firewatch node
//!
//! This test suite validates:
//! - Nearest-resource assignment over gRPC
//! - Simulated execution and registry release
//! - Per-emergency status streaming
//! - Registration ledger updates
//! - Batch orchestration against a live node

pub mod test_utils;

#[cfg(test)]
mod dispatch_flow_tests;
