//! Resource Registry - drone records for Firewatch dispatch
//!
//! This crate provides the accessor over the resource registry, the only
//! process-wide mutable state in the dispatch pipeline. It handles:
//! - Scans for available resources, ordered by resource id
//! - Single-key reads and updates
//! - Atomic reservation (compare-and-set on `status`)
//!
//! Two backends are provided: [`MemoryRegistry`] for tests and single-process
//! demos, and [`SqliteRegistry`] for a registry that survives restarts.
//!
//! # Reservation
//!
//! [`ResourceRegistry::try_reserve`] flips `available -> busy` in one step and
//! reports whether it won. Callers must never read-then-write the status to
//! reserve; two concurrent dispatches would both succeed.

#![warn(missing_docs)]

pub mod memory;
pub mod sqlite;

use firewatch_core::config::{RegistryBackend, RegistryConfig};
use firewatch_core::{Coordinate, ResourceRecord, ResourceStatus};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No record with this id
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Backend cannot be reached
    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    /// Stored record cannot be decoded
    #[error("Corrupt record for resource {id}: {reason}")]
    Corrupt {
        /// Resource identifier
        id: String,
        /// What was wrong with it
        reason: String,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Read/update interface over drone records keyed by id.
///
/// All operations are single-document. Implementations must return scans in
/// ascending id order so nearest-resource ties resolve deterministically.
///
/// Methods are synchronous. The SQLite backend runs one short statement on the
/// calling thread per call; async callers invoke them inline, not through
/// `spawn_blocking`.
pub trait ResourceRegistry: Send + Sync {
    /// All resources currently `available`, ordered by id
    fn find_available(&self) -> Result<Vec<ResourceRecord>, RegistryError>;

    /// A single resource by id
    fn find_by_id(&self, id: &str) -> Result<ResourceRecord, RegistryError>;

    /// All resources regardless of status, ordered by id
    fn find_all(&self) -> Result<Vec<ResourceRecord>, RegistryError>;

    /// Set the status of a resource
    fn update_status(&self, id: &str, status: ResourceStatus) -> Result<(), RegistryError>;

    /// Set location and status of a resource in one write
    fn update_location_and_status(
        &self,
        id: &str,
        location: Coordinate,
        status: ResourceStatus,
    ) -> Result<(), RegistryError>;

    /// Atomically mark `busy` if currently `available`.
    ///
    /// Returns `Ok(false)` when the resource exists but is already busy.
    fn try_reserve(&self, id: &str) -> Result<bool, RegistryError>;

    /// Insert or replace a record
    fn upsert(&self, record: ResourceRecord) -> Result<(), RegistryError>;

    /// Insert a record unless one with the same id exists.
    ///
    /// Returns whether the record was inserted; an existing record is left
    /// untouched.
    fn insert_if_absent(&self, record: ResourceRecord) -> Result<bool, RegistryError>;
}

/// Insert every record not yet present, returning how many were new.
///
/// Records already in the registry keep their stored location and status.
pub fn seed(
    registry: &dyn ResourceRegistry,
    records: impl IntoIterator<Item = ResourceRecord>,
) -> Result<usize, RegistryError> {
    let mut count = 0;
    for record in records {
        if registry.insert_if_absent(record)? {
            count += 1;
        }
    }
    Ok(count)
}

/// Open the configured backend and seed it with the configured resources
pub fn open(config: &RegistryConfig) -> Result<Arc<dyn ResourceRegistry>, RegistryError> {
    let registry: Arc<dyn ResourceRegistry> = match config.backend {
        RegistryBackend::Memory => Arc::new(MemoryRegistry::new()),
        RegistryBackend::Sqlite => match &config.path {
            Some(path) => Arc::new(SqliteRegistry::open(path)?),
            None => Arc::new(SqliteRegistry::open_in_memory()?),
        },
    };

    let seeded = seed(
        registry.as_ref(),
        config.resources.iter().map(|s| s.to_record()),
    )?;

    info!(
        backend = ?config.backend,
        seeded,
        "Resource registry ready"
    );

    Ok(registry)
}
