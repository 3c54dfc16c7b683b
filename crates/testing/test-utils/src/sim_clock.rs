use chrono::{DateTime, Utc};
use concepts::time::ClockFn;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Manually driven clock shared by all of its clones.
#[derive(Clone)]
pub struct SimClock {
    current_time: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl SimClock {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(std::sync::Mutex::new(now)),
        }
    }

    /// Called by a test to move the time forward.
    pub fn move_time_forward(&self, duration: Duration) {
        let mut guard = self.current_time.lock().unwrap();
        let old = *guard;
        *guard = old + duration;
        info!("Set clock from `{old}` to `{new}`", new = *guard);
    }

    pub fn move_time_to(&self, new: DateTime<Utc>) {
        let mut guard = self.current_time.lock().unwrap();
        let old = *guard;
        assert!(old <= new, "time must not go backwards");
        *guard = new;
        info!("Set clock from `{old}` to `{new}`");
    }
}

impl ClockFn for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current_time.lock().unwrap()
    }
}
