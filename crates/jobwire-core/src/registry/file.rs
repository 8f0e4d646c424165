use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use jobwire_model::{JobId, JobRecord};
use tracing::debug;

use super::JobRegistry;
use crate::error::RegistryError;

/// File identity used to notice writes by other processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Debug, Default)]
struct Snapshot {
    records: BTreeMap<JobId, JobRecord>,
    stamp: Option<Stamp>,
}

/// Registry persisted as one JSON array of records.
///
/// Every mutation rewrites the whole file through a temporary sibling and a
/// rename, so readers never observe a partially written snapshot. The job
/// submitter registers jobs by replacing the file the same way; the cached
/// snapshot is reloaded whenever the file's modification time or size changes.
#[derive(Debug)]
pub struct JsonFileRegistry {
    path: PathBuf,
    snapshot: Mutex<Snapshot>,
}

impl JsonFileRegistry {
    /// Load `path`, starting empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let registry = Self {
            path: path.into(),
            snapshot: Mutex::new(Snapshot::default()),
        };
        let count = registry.current()?.records.len();
        debug!(path = %registry.path.display(), records = count, "registry loaded");
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn stamp(&self) -> Result<Option<Stamp>, RegistryError> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(Some(Stamp {
                modified: meta.modified().map_err(|source| self.io(source))?,
                len: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.io(source)),
        }
    }

    fn io(&self, source: io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Snapshot matching the file on disk, reloading it if it changed.
    fn current(&self) -> Result<MutexGuard<'_, Snapshot>, RegistryError> {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        let stamp = self.stamp()?;
        if stamp.is_some() && stamp == snapshot.stamp {
            return Ok(snapshot);
        }

        let records = match fs::read(&self.path) {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(raw) => {
                let list: Vec<JobRecord> =
                    serde_json::from_slice(&raw).map_err(|source| RegistryError::Corrupt {
                        path: self.path.clone(),
                        source,
                    })?;
                list.into_iter().map(|r| (r.job_id.clone(), r)).collect()
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(self.io(source)),
        };
        if snapshot.stamp.is_some() {
            debug!(path = %self.path.display(), records = records.len(), "registry changed on disk; reloaded");
        }
        snapshot.records = records;
        snapshot.stamp = stamp;
        Ok(snapshot)
    }

    fn persist(&self, snapshot: &mut Snapshot) -> Result<(), RegistryError> {
        let list: Vec<&JobRecord> = snapshot.records.values().collect();
        let body = serde_json::to_vec_pretty(&list).map_err(RegistryError::Serialize)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body).map_err(|source| self.io(source))?;
        fs::rename(&tmp, &self.path).map_err(|source| self.io(source))?;
        snapshot.stamp = self.stamp()?;
        Ok(())
    }
}

impl JobRegistry for JsonFileRegistry {
    fn get(&self, id: &JobId) -> Result<Option<JobRecord>, RegistryError> {
        Ok(self.current()?.records.get(id).cloned())
    }

    fn put(&mut self, record: JobRecord) -> Result<(), RegistryError> {
        let mut snapshot = self.current()?;
        let previous = snapshot.records.insert(record.job_id.clone(), record.clone());
        if let Err(e) = self.persist(&mut snapshot) {
            match previous {
                Some(p) => snapshot.records.insert(record.job_id, p),
                None => snapshot.records.remove(&record.job_id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn delete(&mut self, id: &JobId) -> Result<bool, RegistryError> {
        let mut snapshot = self.current()?;
        let Some(previous) = snapshot.records.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.persist(&mut snapshot) {
            snapshot.records.insert(id.clone(), previous);
            return Err(e);
        }
        Ok(true)
    }

    fn scan(&self) -> Result<Vec<JobRecord>, RegistryError> {
        Ok(self.current()?.records.values().cloned().collect())
    }
}
