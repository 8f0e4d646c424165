use std::time::Instant;

use jobwire_core::UpdaterConfig;

/// Next due instant of each periodic engine activity.
#[derive(Debug, Clone, Copy)]
pub(super) struct Timers {
    pub query: Instant,
    pub final_query: Instant,
    pub purge: Instant,
    pub consistency: Instant,
}

impl Timers {
    /// The first state query runs immediately; everything else waits one period.
    pub fn start(now: Instant, config: &UpdaterConfig) -> Self {
        Self {
            query: now,
            final_query: now + config.final_query_interval(),
            purge: now + config.purge_interval(),
            consistency: now + config.consistency_interval(),
        }
    }

    /// Earliest timer worth waking for. Poll timers are skipped while a poll is running.
    pub fn nearest(&self, poll_busy: bool) -> Instant {
        let housekeeping = self.purge.min(self.consistency);
        if poll_busy {
            housekeeping
        } else {
            housekeeping.min(self.query).min(self.final_query)
        }
    }
}
