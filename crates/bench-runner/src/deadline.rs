use std::time::{Duration, Instant};

/// Wall-clock budget shared by every suspension point of one task.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub fn after(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit: Some(limit),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            started: Instant::now(),
            limit: None,
        }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.limit
            .map(|limit| limit.saturating_sub(self.started.elapsed()))
    }

    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(rest) if rest.is_zero())
    }

    /// Caps a per-call timeout by what is left of the budget.
    pub fn bound(&self, per_call: Duration) -> Duration {
        match self.remaining() {
            Some(rest) => per_call.min(rest),
            None => per_call,
        }
    }
}
