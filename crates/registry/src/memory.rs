//! In-process registry backend
//!
//! An ordered map under a mutex. Every operation holds the lock for its whole
//! duration, which makes `try_reserve` a true compare-and-set.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use firewatch_core::{Coordinate, ResourceRecord, ResourceStatus};

use crate::{RegistryError, ResourceRegistry};

/// Registry held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    resources: Mutex<BTreeMap<String, ResourceRecord>>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the given records
    pub fn with_resources(records: impl IntoIterator<Item = ResourceRecord>) -> Self {
        let resources = records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<BTreeMap<_, _>>();
        Self {
            resources: Mutex::new(resources),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, ResourceRecord>>, RegistryError> {
        self.resources
            .lock()
            .map_err(|e| RegistryError::Unavailable(format!("Lock error: {}", e)))
    }

    fn with_record<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ResourceRecord) -> T,
    ) -> Result<T, RegistryError> {
        let mut resources = self.lock()?;
        let record = resources
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok(f(record))
    }
}

impl ResourceRegistry for MemoryRegistry {
    fn find_available(&self) -> Result<Vec<ResourceRecord>, RegistryError> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| r.is_available())
            .cloned()
            .collect())
    }

    fn find_by_id(&self, id: &str) -> Result<ResourceRecord, RegistryError> {
        self.lock()?
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn find_all(&self) -> Result<Vec<ResourceRecord>, RegistryError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn update_status(&self, id: &str, status: ResourceStatus) -> Result<(), RegistryError> {
        self.with_record(id, |record| record.status = status)
    }

    fn update_location_and_status(
        &self,
        id: &str,
        location: Coordinate,
        status: ResourceStatus,
    ) -> Result<(), RegistryError> {
        self.with_record(id, |record| {
            record.location = location;
            record.status = status;
        })
    }

    fn try_reserve(&self, id: &str) -> Result<bool, RegistryError> {
        self.with_record(id, |record| {
            if record.is_available() {
                record.status = ResourceStatus::Busy;
                true
            } else {
                false
            }
        })
    }

    fn upsert(&self, record: ResourceRecord) -> Result<(), RegistryError> {
        self.lock()?.insert(record.id.clone(), record);
        Ok(())
    }

    fn insert_if_absent(&self, record: ResourceRecord) -> Result<bool, RegistryError> {
        let mut resources = self.lock()?;
        if resources.contains_key(&record.id) {
            return Ok(false);
        }
        resources.insert(record.id.clone(), record);
        Ok(true)
    }
}
