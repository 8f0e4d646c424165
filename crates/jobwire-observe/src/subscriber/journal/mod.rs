use async_trait::async_trait;
use jobwire_core::Subscribe;
use jobwire_model::UpdaterEvent;

use crate::subscriber::view::log_event;

/// Writes every updater event to the process log.
#[derive(Debug, Default)]
pub struct Journal;

impl Journal {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for Journal {
    async fn on_event(&self, event: &UpdaterEvent) {
        log_event(event);
    }
    fn name(&self) -> &'static str {
        "journal"
    }
    fn queue_capacity(&self) -> usize {
        2048
    }
}
