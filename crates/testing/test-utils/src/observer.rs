use concepts::observer::{EngineEvent, Observer};
use std::sync::{Arc, Mutex};

/// Keeps every event for later inspection.
#[derive(Clone, Default)]
pub struct RecordingObserver(Arc<Mutex<Vec<EngineEvent>>>);

impl RecordingObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<EngineEvent> {
        self.0.lock().unwrap().clone()
    }

    #[must_use]
    pub fn count(&self, predicate: impl Fn(&EngineEvent) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }
}

impl Observer for RecordingObserver {
    fn on_event(&self, event: &EngineEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}
