//! Periodic discovery of business events that still owe a follow-up prompt.
//!
//! Each cycle is stateless: what was already issued lives in the delivery
//! ledger, what was answered lives on the event itself.
use crate::{
    dispatcher::Dispatcher,
    task::{TaskHandle, log_err_if_new},
    tracker::DeliveryTracker,
};
use chrono::TimeDelta;
use concepts::{
    BusinessEvent, EventKind, NotificationKind, PushPayload, TrackingKey,
    observer::{EngineEvent, Fallback, Observer, StoreOperation},
    storage::{DbErrorGeneric, EventSource},
    time::ClockFn,
};
use std::{sync::Arc, time::Duration};
use tracing::{Level, debug, instrument, warn};

/// Prompt issued for a due event.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub tick_sleep: Duration,
    /// Trailing window `W`. Events ending in `[now - W, now]` are candidates.
    pub lookback: TimeDelta,
    pub event_kind: EventKind,
    /// Used when the event's `has_outcome` flag is set.
    pub with_outcome: PromptTemplate,
    pub without_outcome: PromptTemplate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub candidates: usize,
    /// Already in the ledger.
    pub skipped: usize,
    /// Nothing was delivered, the event stays a candidate.
    pub deferred: usize,
    /// Delivered and marked.
    pub processed: usize,
}

pub struct EventScanner<C: ClockFn> {
    events: Arc<dyn EventSource>,
    dispatcher: Dispatcher,
    tracker: DeliveryTracker<C>,
    config: ScannerConfig,
    clock_fn: C,
    observer: Arc<dyn Observer>,
}

impl<C: ClockFn> EventScanner<C> {
    #[must_use]
    pub fn new(
        events: Arc<dyn EventSource>,
        dispatcher: Dispatcher,
        tracker: DeliveryTracker<C>,
        config: ScannerConfig,
        clock_fn: C,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            events,
            dispatcher,
            tracker,
            config,
            clock_fn,
            observer,
        }
    }

    fn prompt_for(&self, event: &BusinessEvent) -> &PromptTemplate {
        if event.has_outcome {
            &self.config.with_outcome
        } else {
            &self.config.without_outcome
        }
    }

    /// Runs one scan cycle: check, then send, then mark.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn tick(&self) -> Result<ScanReport, DbErrorGeneric> {
        let window_end = self.clock_fn.now();
        let window_start = window_end - self.config.lookback;
        let events = match self
            .events
            .due_events(&self.config.event_kind, window_start, window_end)
            .await
        {
            Ok(events) => events,
            Err(err) => {
                self.observer.on_event(&EngineEvent::StoreFallback {
                    operation: StoreOperation::DueEvents,
                    fallback: Fallback::EmptyList,
                });
                return Err(err);
            }
        };
        let mut report = ScanReport {
            candidates: events.len(),
            ..ScanReport::default()
        };
        for event in events {
            let prompt = self.prompt_for(&event);
            let tracking_key = TrackingKey::for_event(&prompt.kind, &event.id);
            if self.tracker.is_sent(&tracking_key).await {
                self.observer
                    .on_event(&EngineEvent::NotificationSkipped { tracking_key });
                report.skipped += 1;
                continue;
            }
            let payload = PushPayload {
                title: prompt.title.clone(),
                body: prompt.body.clone(),
                url: prompt.url.clone(),
                tag: Some(tracking_key.to_string()),
                silent: false,
            };
            let outcome = self.dispatcher.send(&event.owner_id, &payload).await;
            if !outcome.is_delivered() {
                self.observer.on_event(&EngineEvent::NotificationDeferred {
                    event_id: event.id.clone(),
                    outcome,
                });
                report.deferred += 1;
                continue;
            }
            if self
                .tracker
                .mark_sent(&tracking_key, &event.owner_id, None)
                .await
            {
                report.processed += 1;
            } else {
                warn!(%tracking_key, "Delivered but not marked, the prompt may repeat");
            }
        }
        self.observer.on_event(&EngineEvent::ScanFinished {
            candidates: report.candidates,
            processed: report.processed,
        });
        debug!(?report, "Scan finished");
        Ok(report)
    }
}

/// Spawns the scan loop.
pub fn spawn_new<C: ClockFn>(scanner: EventScanner<C>) -> TaskHandle {
    let tick_sleep = scanner.config.tick_sleep;
    let scanner = Arc::new(scanner);
    let old_err = Arc::new(std::sync::Mutex::new(None::<DbErrorGeneric>));
    TaskHandle::spawn_periodic("event_scanner", tick_sleep, move || {
        let scanner = scanner.clone();
        let old_err = old_err.clone();
        async move {
            let res = scanner.tick().await;
            if let Ok(mut old_err) = old_err.lock() {
                log_err_if_new(res, &mut old_err);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, SpyLedger, at, subscribe};
    use concepts::{
        DeliveryOutcome, EventId, RecipientId,
        storage::{DbPool, DbPoolCloseable},
    };
    use std::time::Duration;
    use test_utils::transport::Reply;

    const LOOKBACK_SECS: i64 = 2 * 60 * 60;

    fn config() -> ScannerConfig {
        ScannerConfig {
            tick_sleep: Duration::from_secs(60),
            lookback: TimeDelta::seconds(LOOKBACK_SECS),
            event_kind: EventKind::new_unchecked("appointment"),
            with_outcome: PromptTemplate {
                kind: NotificationKind::new_unchecked("post_sale"),
                title: "How did it go?".to_string(),
                body: "Record the sale".to_string(),
                url: None,
            },
            without_outcome: PromptTemplate {
                kind: NotificationKind::new_unchecked("post_visit"),
                title: "How did it go?".to_string(),
                body: "Record the outcome".to_string(),
                url: Some("/outcome".to_string()),
            },
        }
    }

    fn scanner(fixture: &Fixture) -> EventScanner<test_utils::sim_clock::SimClock> {
        EventScanner::new(
            fixture.pool.events(),
            fixture.dispatcher.clone(),
            fixture.tracker.clone(),
            config(),
            fixture.clock.clone(),
            Arc::new(fixture.observer.clone()),
        )
    }

    fn event(id: &str, owner: &str, end_secs: i64, has_outcome: bool) -> BusinessEvent {
        BusinessEvent {
            id: EventId::new_unchecked(id),
            owner_id: RecipientId::new_unchecked(owner),
            kind: EventKind::new_unchecked("appointment"),
            end_time: at(end_secs),
            has_outcome,
            answered: false,
        }
    }

    fn key(s: &str) -> TrackingKey {
        TrackingKey::from_parts(&[s]).unwrap()
    }

    #[tokio::test]
    async fn partial_failure_marks_and_cleans() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/b").await;
        fixture.transport.set_reply("https://push/b", Reply::Status(404));
        fixture.clock.move_time_to(at(600));
        fixture.pool.upsert_event(event("e42", "u1", 0, true)).unwrap();
        let scanner = scanner(&fixture);

        let report = scanner.tick().await.unwrap();

        assert_eq!(
            ScanReport {
                candidates: 1,
                skipped: 0,
                deferred: 0,
                processed: 1
            },
            report
        );
        assert!(fixture.tracker.is_sent(&key("post_sale_e42")).await);
        let history = fixture
            .tracker
            .history(&RecipientId::new_unchecked("u1"), None)
            .await;
        assert_eq!(1, history.len());
        assert_eq!("u1", history[0].recipient_id.as_str());
        let remaining = fixture
            .dispatcher
            .registry()
            .list(&RecipientId::new_unchecked("u1"))
            .await;
        assert_eq!(1, remaining.len());
        assert_eq!("https://push/a", remaining[0].endpoint.as_str());

        // Rerun short-circuits on the ledger.
        let attempts = fixture.transport.sent().len();
        let report = scanner.tick().await.unwrap();
        assert_eq!(1, report.skipped);
        assert_eq!(0, report.processed);
        assert_eq!(attempts, fixture.transport.sent().len());
        assert_eq!(
            1,
            fixture.observer.count(|e| matches!(
                e,
                concepts::observer::EngineEvent::SubscriptionRemoved { .. }
            ))
        );
    }

    #[tokio::test]
    async fn nothing_delivered_means_no_mark() {
        test_utils::set_up();
        let spy = Arc::new(SpyLedger::wrapping(db_mem::inmemory_dao::InMemoryPool::new().ledger()));
        let fixture = Fixture::with_ledger(Some(spy.clone()));
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        fixture.transport.set_reply("https://push/a", Reply::Status(503));
        fixture.clock.move_time_to(at(600));
        fixture.pool.upsert_event(event("e1", "u1", 0, false)).unwrap();
        // u2 has no subscriptions at all
        fixture.pool.upsert_event(event("e2", "u2", 0, false)).unwrap();
        let scanner = scanner(&fixture);

        let report = scanner.tick().await.unwrap();

        assert_eq!(2, report.deferred);
        assert_eq!(0, spy.marks());
        assert_eq!(
            1,
            fixture.observer.count(|e| matches!(
                e,
                concepts::observer::EngineEvent::NotificationDeferred {
                    outcome: DeliveryOutcome {
                        sent: 0,
                        failed: 1,
                        cleaned: 0
                    },
                    ..
                }
            ))
        );

        // Retried on the next scan once the transport recovers.
        fixture.transport.set_reply("https://push/a", Reply::Accept);
        let report = scanner.tick().await.unwrap();
        assert_eq!(1, report.processed);
        assert_eq!(1, spy.marks());
    }

    #[tokio::test]
    async fn window_lower_bound_is_inclusive() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        let now = 10_000;
        fixture.clock.move_time_to(at(now));
        fixture
            .pool
            .upsert_event(event("boundary", "u1", now - LOOKBACK_SECS, false))
            .unwrap();
        let mut too_old = event("too_old", "u1", now - LOOKBACK_SECS, false);
        too_old.end_time -= TimeDelta::milliseconds(1);
        fixture.pool.upsert_event(too_old).unwrap();
        fixture
            .pool
            .upsert_event(event("upcoming", "u1", now + 1, false))
            .unwrap();
        let mut answered = event("answered", "u1", now - 60, false);
        answered.answered = true;
        fixture.pool.upsert_event(answered).unwrap();

        let report = scanner(&fixture).tick().await.unwrap();

        assert_eq!(1, report.candidates);
        assert!(fixture.tracker.is_sent(&key("post_visit_boundary")).await);
        assert!(!fixture.tracker.is_sent(&key("post_visit_too_old")).await);
    }

    #[tokio::test]
    async fn ledger_outage_suppresses_sends() {
        test_utils::set_up();
        let fixture = Fixture::with_ledger(Some(Arc::new(SpyLedger::failing())));
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        fixture.clock.move_time_to(at(600));
        fixture.pool.upsert_event(event("e1", "u1", 0, false)).unwrap();

        let report = scanner(&fixture).tick().await.unwrap();

        assert_eq!(1, report.skipped);
        assert!(fixture.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn event_store_outage_fails_the_tick() {
        test_utils::set_up();
        let fixture = Fixture::new();
        let scanner = scanner(&fixture);
        fixture.pool.clone().close().await;
        assert_eq!(Err(DbErrorGeneric::Close), scanner.tick().await);
    }

    #[tokio::test]
    async fn spawned_scanner_processes_and_closes() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        fixture.clock.move_time_to(at(600));
        fixture.pool.upsert_event(event("e1", "u1", 0, false)).unwrap();

        let handle = spawn_new(scanner(&fixture));
        while !fixture.tracker.is_sent(&key("post_visit_e1")).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::timeout(Duration::from_secs(5), handle.close())
            .await
            .expect("close must not wait out the tick interval");
        assert_eq!(1, fixture.transport.attempts_to("https://push/a"));
    }
}
