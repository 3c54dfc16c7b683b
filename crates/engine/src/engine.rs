use crate::{
    api::NotificationApi,
    broadcast::{BroadcastConfig, BroadcastLog},
    dispatcher::{Dispatcher, DispatcherConfig},
    registry::SubscriptionRegistry,
    scanner::{EventScanner, ScannerConfig},
    tracker::{DEFAULT_HISTORY_LIMIT, DeliveryTracker},
};
use concepts::{
    observer::Observer,
    storage::{DbPool, EventSource},
    time::ClockFn,
    transport::PushTransport,
};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub broadcast: BroadcastConfig,
    pub history_limit: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            broadcast: BroadcastConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// All components wired to one store, one transport and one clock.
#[derive(Clone)]
pub struct Engine<C: ClockFn> {
    pub registry: SubscriptionRegistry,
    pub tracker: DeliveryTracker<C>,
    pub dispatcher: Dispatcher,
    pub api: NotificationApi<C>,
    events: Arc<dyn EventSource>,
    clock_fn: C,
    observer: Arc<dyn Observer>,
}

impl<C: ClockFn> Engine<C> {
    pub fn new(
        db_pool: &dyn DbPool,
        transport: Arc<dyn PushTransport>,
        clock_fn: C,
        observer: Arc<dyn Observer>,
        config: EngineConfig,
    ) -> Self {
        let registry = SubscriptionRegistry::new(db_pool.subscriptions(), observer.clone());
        let tracker = DeliveryTracker::new(db_pool.ledger(), clock_fn.clone(), observer.clone());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            transport,
            config.dispatcher,
            observer.clone(),
        );
        let broadcast_log = BroadcastLog::new(
            dispatcher.clone(),
            db_pool.broadcasts(),
            config.broadcast,
            clock_fn.clone(),
            observer.clone(),
        );
        let api = NotificationApi::new(tracker.clone(), broadcast_log, config.history_limit);
        Self {
            registry,
            tracker,
            dispatcher,
            api,
            events: db_pool.events(),
            clock_fn,
            observer,
        }
    }

    #[must_use]
    pub fn scanner(&self, config: ScannerConfig) -> EventScanner<C> {
        EventScanner::new(
            self.events.clone(),
            self.dispatcher.clone(),
            self.tracker.clone(),
            config,
            self.clock_fn.clone(),
            self.observer.clone(),
        )
    }
}
