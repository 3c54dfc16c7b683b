//! Operator-initiated broadcasts and their bounded audit log.
use crate::dispatcher::Dispatcher;
use concepts::{
    BroadcastId, BroadcastMessage, BroadcastOutcome, PushPayload, RecipientSelector,
    observer::{EngineEvent, Fallback, Observer, StoreOperation},
    storage::BroadcastStore,
    time::ClockFn,
};
use std::sync::Arc;
use tracing::{Level, instrument, warn};

pub const DEFAULT_RETAIN: u32 = 100;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// Number of most recent entries kept in the log.
    pub retain: u32,
    pub title: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            retain: DEFAULT_RETAIN,
            title: "Announcement".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct BroadcastLog<C: ClockFn> {
    dispatcher: Dispatcher,
    store: Arc<dyn BroadcastStore>,
    config: BroadcastConfig,
    clock_fn: C,
    observer: Arc<dyn Observer>,
}

impl<C: ClockFn> BroadcastLog<C> {
    #[must_use]
    pub fn new(
        dispatcher: Dispatcher,
        store: Arc<dyn BroadcastStore>,
        config: BroadcastConfig,
        clock_fn: C,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            dispatcher,
            store,
            config,
            clock_fn,
            observer,
        }
    }

    /// Sends `text` to every subscription selected by `recipient_selector` and
    /// appends one log entry. Repeated calls send again.
    ///
    /// `total` counts subscriptions, not recipients. Permanent failures count
    /// as `failed` and their subscriptions are removed.
    #[instrument(level = Level::DEBUG, skip(self, text))]
    pub async fn broadcast(
        &self,
        text: &str,
        recipient_selector: RecipientSelector,
        issued_by: &str,
    ) -> BroadcastOutcome {
        let registry = self.dispatcher.registry();
        let subscriptions = match &recipient_selector {
            RecipientSelector::All => registry.list_all().await,
            RecipientSelector::Explicit(recipient_ids) => registry.list_many(recipient_ids).await,
        };
        let delivery = if subscriptions.is_empty() {
            concepts::DeliveryOutcome::default()
        } else {
            let payload = PushPayload::new(self.config.title.clone(), text);
            self.dispatcher
                .deliver_all(&subscriptions, &payload.serialize())
                .await
        };
        let outcome = BroadcastOutcome {
            sent: delivery.sent,
            failed: delivery.failed + delivery.cleaned,
            total: u32::try_from(subscriptions.len()).unwrap_or(u32::MAX),
        };
        let message = BroadcastMessage {
            id: BroadcastId::generate(),
            text: text.to_string(),
            recipient_selector,
            sent_count: outcome.sent,
            failed_count: outcome.failed,
            total_targeted: outcome.total,
            issued_by: issued_by.to_string(),
            issued_at: self.clock_fn.now(),
        };
        if let Err(err) = self.store.append(message, self.config.retain).await {
            warn!("Cannot append to the broadcast log - {err:?}");
            self.observer.on_event(&EngineEvent::StoreFallback {
                operation: StoreOperation::AppendBroadcast,
                fallback: Fallback::ReportedFailure,
            });
        }
        self.observer.on_event(&EngineEvent::BroadcastSent {
            sent: outcome.sent,
            failed: outcome.failed,
            total: outcome.total,
        });
        outcome
    }

    /// Newest first.
    pub async fn recent(&self, limit: u32) -> Vec<BroadcastMessage> {
        match self.store.list(limit).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!("Cannot read the broadcast log - {err:?}");
                self.observer.on_event(&EngineEvent::StoreFallback {
                    operation: StoreOperation::ListBroadcasts,
                    fallback: Fallback::EmptyList,
                });
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, subscribe};
    use concepts::{RecipientId, storage::DbPool};
    use test_utils::{sim_clock::SimClock, transport::Reply};

    fn log(fixture: &Fixture, retain: u32) -> BroadcastLog<SimClock> {
        BroadcastLog::new(
            fixture.dispatcher.clone(),
            fixture.pool.broadcasts(),
            BroadcastConfig {
                retain,
                ..BroadcastConfig::default()
            },
            fixture.clock.clone(),
            Arc::new(fixture.observer.clone()),
        )
    }

    #[tokio::test]
    async fn total_counts_subscriptions_not_recipients() {
        test_utils::set_up();
        let fixture = Fixture::new();
        let registry = fixture.dispatcher.registry();
        subscribe(registry, "u1", "https://push/u1-phone").await;
        subscribe(registry, "u1", "https://push/u1-laptop").await;
        subscribe(registry, "u2", "https://push/u2-phone").await;
        fixture.transport.set_reply("https://push/u2-phone", Reply::Status(500));
        let log = log(&fixture, DEFAULT_RETAIN);

        let outcome = log
            .broadcast("maintenance at noon", RecipientSelector::All, "ops")
            .await;

        assert_eq!(
            BroadcastOutcome {
                sent: 2,
                failed: 1,
                total: 3
            },
            outcome
        );
        let entries = log.recent(10).await;
        assert_eq!(1, entries.len());
        assert_eq!(3, entries[0].total_targeted);
        assert_eq!("ops", entries[0].issued_by);
    }

    #[tokio::test]
    async fn explicit_recipient_without_subscriptions_adds_nothing_to_total() {
        test_utils::set_up();
        let fixture = Fixture::new();
        let registry = fixture.dispatcher.registry();
        subscribe(registry, "u1", "https://push/u1-phone").await;
        subscribe(registry, "u1", "https://push/u1-laptop").await;
        subscribe(registry, "u2", "https://push/u2-phone").await;
        let log = log(&fixture, DEFAULT_RETAIN);

        let selector = RecipientSelector::Explicit(
            ["u1", "u2", "u3"]
                .into_iter()
                .map(RecipientId::new_unchecked)
                .collect(),
        );
        let outcome = log.broadcast("new feature", selector.clone(), "ops").await;

        assert_eq!(
            BroadcastOutcome {
                sent: 3,
                failed: 0,
                total: 3
            },
            outcome
        );
        let entries = log.recent(10).await;
        assert_eq!(1, entries.len());
        assert_eq!(selector, entries[0].recipient_selector);
        assert_eq!(3, entries[0].total_targeted);
        assert_eq!(3, fixture.transport.sent().len());
    }

    #[tokio::test]
    async fn explicit_selector_without_subscriptions_is_all_zero() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        let log = log(&fixture, DEFAULT_RETAIN);

        let outcome = log
            .broadcast(
                "hello",
                RecipientSelector::Explicit(vec![RecipientId::new_unchecked("u3")]),
                "ops",
            )
            .await;

        assert_eq!(BroadcastOutcome::default(), outcome);
        assert!(fixture.transport.sent().is_empty());
        assert_eq!(1, log.recent(10).await.len());
    }

    #[tokio::test]
    async fn gone_endpoint_counts_as_failed_and_is_cleaned() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        fixture.transport.set_reply("https://push/a", Reply::Status(410));
        let log = log(&fixture, DEFAULT_RETAIN);

        let outcome = log
            .broadcast(
                "hello",
                RecipientSelector::Explicit(vec![RecipientId::new_unchecked("u1")]),
                "ops",
            )
            .await;

        assert_eq!(
            BroadcastOutcome {
                sent: 0,
                failed: 1,
                total: 1
            },
            outcome
        );
        assert!(fixture.dispatcher.registry().list_all().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_broadcasts_resend_and_log_is_capped() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        let log = log(&fixture, 3);

        for idx in 0..5 {
            log.broadcast(&format!("message {idx}"), RecipientSelector::All, "ops")
                .await;
        }

        assert_eq!(5, fixture.transport.attempts_to("https://push/a"));
        let texts: Vec<_> = log
            .recent(10)
            .await
            .into_iter()
            .map(|message| message.text)
            .collect();
        assert_eq!(vec!["message 4", "message 3", "message 2"], texts);
    }
}
