use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use jobwire_model::{JobId, JobRecord};

use super::JobRegistry;
use crate::error::RegistryError;

/// In-memory registry.
///
/// Clones share the same map, so a test or the job submitter can keep a handle
/// while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    inner: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        let map = records
            .into_iter()
            .map(|r| (r.job_id.clone(), r))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<JobId, JobRecord>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<JobId, JobRecord>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl JobRegistry for MemoryRegistry {
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.read().get(id).cloned())
    }

    fn put(&mut self, record: JobRecord) -> Result<(), RegistryError> {
        self.write().insert(record.job_id.clone(), record);
        Ok(())
    }

    fn delete(&mut self, id: &JobId) -> Result<bool, RegistryError> {
        Ok(self.write().remove(id).is_some())
    }

    fn scan(&self) -> Result<Vec<JobRecord>, RegistryError> {
        Ok(self.read().values().cloned().collect())
    }
}
