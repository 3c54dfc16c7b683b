use crate::{dispatcher::Dispatcher, task::TaskHandle};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
}

/// Spawns the periodic invalid-subscription sweep.
pub fn spawn_new(dispatcher: Dispatcher, config: SweeperConfig) -> TaskHandle {
    TaskHandle::spawn_periodic("subscription_sweeper", config.interval, move || {
        let dispatcher = dispatcher.clone();
        async move {
            let cleaned = dispatcher.sweep_invalid().await;
            debug!(cleaned, "Sweep tick finished");
        }
    })
}
