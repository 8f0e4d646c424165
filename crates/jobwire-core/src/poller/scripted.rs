use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::SystemTime,
};

use async_trait::async_trait;
use jobwire_model::{JobId, JobObservation};

use super::BatchPoller;
use crate::error::PollerError;

#[derive(Default)]
struct Script {
    snapshots: VecDeque<Vec<JobObservation>>,
    last: Vec<JobObservation>,
    history: HashMap<JobId, JobObservation>,
    listings: usize,
}

/// Poller replaying queued snapshots, for tests and dry runs.
///
/// Each listing consumes the next queued snapshot; once the queue is empty the
/// last snapshot is repeated. Clones share the same script.
#[derive(Clone, Default)]
pub struct ScriptedPoller {
    inner: Arc<Mutex<Script>>,
}

impl ScriptedPoller {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_snapshot(&self, snapshot: Vec<JobObservation>) {
        self.lock().snapshots.push_back(snapshot);
    }

    /// Answer for [`BatchPoller::final_state`] lookups of `obs.job_id`.
    pub fn set_final(&self, obs: JobObservation) {
        self.lock().history.insert(obs.job_id.clone(), obs);
    }

    /// Number of listings served so far.
    pub fn listings(&self) -> usize {
        self.lock().listings
    }
}

#[async_trait]
impl BatchPoller for ScriptedPoller {
    async fn current_states(&self) -> Result<Vec<JobObservation>, PollerError> {
        let mut script = self.lock();
        script.listings += 1;
        if let Some(next) = script.snapshots.pop_front() {
            script.last = next;
        }
        Ok(script.last.clone())
    }

    async fn final_state(
        &self,
        job_id: &JobId,
        since: SystemTime,
    ) -> Result<Option<JobObservation>, PollerError> {
        Ok(self
            .lock()
            .history
            .get(job_id)
            .filter(|obs| obs.timestamp >= since)
            .cloned())
    }
}
