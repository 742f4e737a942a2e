//! Per-task time gate keeping progress telemetry at or below one event per
//! second per task.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

pub struct ProgressThrottle {
    min_interval: Duration,
    last_emit: Mutex<HashMap<u64, Instant>>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_emit: Mutex::new(HashMap::new()),
        }
    }

    /// True when an event for this task may be emitted now; records the
    /// emission. The lock is held only for the comparison.
    pub fn should_emit(&self, task_id: u64) -> bool {
        let now = Instant::now();
        let mut last_emit = self.last_emit.lock();
        match last_emit.get(&task_id) {
            Some(prev) if now.duration_since(*prev) < self.min_interval => false,
            _ => {
                last_emit.insert(task_id, now);
                true
            }
        }
    }

    /// Drop a task's record once its pipeline exits.
    pub fn forget(&self, task_id: u64) {
        self.last_emit.lock().remove(&task_id);
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn suppresses_within_interval() {
        let throttle = ProgressThrottle::new(Duration::from_secs(1));

        assert!(throttle.should_emit(1));
        assert!(!throttle.should_emit(1));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!throttle.should_emit(1));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(throttle.should_emit(1));
    }

    #[tokio::test(start_paused = true)]
    async fn tasks_are_throttled_independently() {
        let throttle = ProgressThrottle::new(Duration::from_secs(1));

        assert!(throttle.should_emit(1));
        assert!(throttle.should_emit(2));
        assert!(!throttle.should_emit(1));
        assert!(!throttle.should_emit(2));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_clears_the_record() {
        let throttle = ProgressThrottle::new(Duration::from_secs(1));

        assert!(throttle.should_emit(1));
        throttle.forget(1);
        assert!(throttle.should_emit(1));
    }
}
