//! Event fan-out from the engine to subscribers.
//!
//! The engine never awaits a subscriber. Each subscriber gets its own bounded
//! queue drained by a dedicated worker task; when the queue is full the event
//! is dropped for that subscriber only.

use std::sync::Arc;

use async_trait::async_trait;
use jobwire_model::UpdaterEvent;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &UpdaterEvent);

    fn name(&self) -> &'static str;

    fn queue_capacity(&self) -> usize {
        1024
    }
}

struct Worker {
    name: &'static str,
    tx: mpsc::Sender<Arc<UpdaterEvent>>,
}

/// Running set of subscriber workers.
pub struct EventBus {
    workers: Vec<Worker>,
    handles: Vec<JoinHandle<()>>,
}

impl EventBus {
    /// Spawn one worker per subscriber. Must be called inside a tokio runtime.
    pub fn spawn(subscribers: &[Arc<dyn Subscribe>]) -> Self {
        let mut workers = Vec::with_capacity(subscribers.len());
        let mut handles = Vec::with_capacity(subscribers.len());

        for sub in subscribers {
            let (tx, mut rx) = mpsc::channel::<Arc<UpdaterEvent>>(sub.queue_capacity().max(1));
            let name = sub.name();
            let sub = Arc::clone(sub);
            handles.push(tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    sub.on_event(&event).await;
                }
            }));
            workers.push(Worker { name, tx });
        }
        Self { workers, handles }
    }

    pub fn publish(&self, event: UpdaterEvent) {
        if self.workers.is_empty() {
            return;
        }
        let event = Arc::new(event);
        for worker in &self.workers {
            if let Err(mpsc::error::TrySendError::Full(ev)) = worker.tx.try_send(Arc::clone(&event)) {
                warn!(
                    subscriber = worker.name,
                    kind = ev.kind.as_str(),
                    "subscriber queue full; event dropped"
                );
            }
        }
    }

    /// Close every queue and wait for the workers to drain them.
    pub async fn shutdown(self) {
        drop(self.workers);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
