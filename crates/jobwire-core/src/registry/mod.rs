//! Persistent job id -> [`JobRecord`] store.
//!
//! The registry is populated by the job submitter; the updater only mutates
//! records it already knows about and deletes them when purged.

mod file;
pub use file::JsonFileRegistry;

mod memory;
pub use memory::MemoryRegistry;

use jobwire_model::{JobId, JobRecord};

use crate::error::RegistryError;

pub trait JobRegistry: Send {
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, RegistryError>;

    /// Insert or replace the record keyed by `record.job_id`.
    fn put(&mut self, record: JobRecord) -> Result<(), RegistryError>;

    /// Returns whether a record was removed.
    fn delete(&mut self, id: &JobId) -> Result<bool, RegistryError>;

    /// All records, ordered by job id.
    fn scan(&self) -> Result<Vec<JobRecord>, RegistryError>;
}

impl<R: JobRegistry + ?Sized> JobRegistry for Box<R> {
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, RegistryError> {
        (**self).get(id)
    }

    fn put(&mut self, record: JobRecord) -> Result<(), RegistryError> {
        (**self).put(record)
    }

    fn delete(&mut self, id: &JobId) -> Result<bool, RegistryError> {
        (**self).delete(id)
    }

    fn scan(&self) -> Result<Vec<JobRecord>, RegistryError> {
        (**self).scan()
    }
}
