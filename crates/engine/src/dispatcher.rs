//! Fan-out of one payload to subscriptions, with cleanup of defunct endpoints.
use crate::registry::SubscriptionRegistry;
use concepts::{
    DeliveryOutcome, PushPayload, RecipientId, SerializedPayload, Subscription,
    observer::{AttemptResult, EngineEvent, Observer},
    transport::{FailureClass, PushTransport, SendError},
};
use futures_util::{FutureExt as _, StreamExt as _, stream};
use std::{sync::Arc, time::Duration};
use tracing::{Level, debug, instrument, trace};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Budget of a single transport attempt. Exceeding it is a transient failure.
    pub send_timeout: Duration,
    pub max_concurrent_sends: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(10),
            max_concurrent_sends: 8,
        }
    }
}

/// Result of a single attempt, after cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Sent,
    Failed,
    /// Permanent failure, the subscription was removed.
    Cleaned,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: SubscriptionRegistry,
    transport: Arc<dyn PushTransport>,
    config: DispatcherConfig,
    observer: Arc<dyn Observer>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: SubscriptionRegistry,
        transport: Arc<dyn PushTransport>,
        config: DispatcherConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            registry,
            transport,
            config,
            observer,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    /// Sends the payload to every live subscription of the recipient.
    /// Never creates delivery records.
    #[instrument(level = Level::DEBUG, skip(self, payload))]
    pub async fn send(&self, recipient_id: &RecipientId, payload: &PushPayload) -> DeliveryOutcome {
        let subscriptions = self.registry.list(recipient_id).await;
        if subscriptions.is_empty() {
            debug!("No subscriptions");
            return DeliveryOutcome::default();
        }
        self.deliver_all(&subscriptions, &payload.serialize()).await
    }

    /// Attempts every subscription independently, at most
    /// `max_concurrent_sends` at a time. One failure never stops the others.
    pub async fn deliver_all(
        &self,
        subscriptions: &[Subscription],
        payload: &SerializedPayload,
    ) -> DeliveryOutcome {
        let attempts: Vec<_> = subscriptions
            .iter()
            .map(|subscription| self.deliver_to(subscription, payload).boxed())
            .collect();
        let mut attempts =
            stream::iter(attempts).buffer_unordered(self.config.max_concurrent_sends.max(1));
        let mut outcome = DeliveryOutcome::default();
        while let Some(attempt) = attempts.next().await {
            match attempt {
                Attempt::Sent => outcome.sent += 1,
                Attempt::Failed => outcome.failed += 1,
                Attempt::Cleaned => outcome.cleaned += 1,
            }
        }
        outcome
    }

    /// Single attempt bounded by `send_timeout`. A permanent failure removes the subscription.
    #[instrument(level = Level::TRACE, skip_all, fields(recipient_id = %subscription.recipient_id, endpoint = %subscription.endpoint))]
    pub async fn deliver_to(
        &self,
        subscription: &Subscription,
        payload: &SerializedPayload,
    ) -> Attempt {
        let res = tokio::time::timeout(
            self.config.send_timeout,
            self.transport.send(subscription, payload),
        )
        .await
        .unwrap_or_else(|_elapsed| Err(SendError::timeout()));
        trace!("Transport returned {res:?}");
        let result = match &res {
            Ok(()) => AttemptResult::Sent,
            Err(err) => AttemptResult::Failed(err.class()),
        };
        self.observer.on_event(&EngineEvent::DeliveryAttempted {
            recipient_id: subscription.recipient_id.clone(),
            endpoint: subscription.endpoint.clone(),
            result,
        });
        match res.map_err(|err| err.class()) {
            Ok(()) => Attempt::Sent,
            Err(FailureClass::Transient) => Attempt::Failed,
            Err(FailureClass::Permanent) => {
                if self
                    .registry
                    .remove(&subscription.recipient_id, &subscription.endpoint)
                    .await
                {
                    Attempt::Cleaned
                } else {
                    // Still registered, the next attempt will retry the removal.
                    Attempt::Failed
                }
            }
        }
    }

    /// Probes every known subscription with a silent payload and removes the
    /// permanently failing ones. Returns the number removed.
    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn sweep_invalid(&self) -> u32 {
        let subscriptions = self.registry.list_all().await;
        let outcome = if subscriptions.is_empty() {
            DeliveryOutcome::default()
        } else {
            self.deliver_all(&subscriptions, &PushPayload::probe().serialize())
                .await
        };
        self.observer.on_event(&EngineEvent::SweepFinished {
            probed: subscriptions.len(),
            cleaned: outcome.cleaned as usize,
        });
        outcome.cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, subscribe};
    use assert_matches::assert_matches;
    use concepts::{
        Endpoint,
        observer::{EngineEvent, Fallback, StoreOperation},
        storage::DbPoolCloseable,
    };
    use test_utils::transport::Reply;

    #[tokio::test]
    async fn zero_subscriptions_does_not_touch_transport() {
        test_utils::set_up();
        let fixture = Fixture::new();
        let outcome = fixture
            .dispatcher
            .send(&RecipientId::new_unchecked("u1"), &PushPayload::new("t", "b"))
            .await;
        assert_eq!(DeliveryOutcome::default(), outcome);
        assert!(fixture.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_removes_only_that_subscription() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/b").await;
        fixture.transport.set_reply("https://push/a", Reply::Status(410));

        let u1 = RecipientId::new_unchecked("u1");
        let outcome = fixture.dispatcher.send(&u1, &PushPayload::new("t", "b")).await;

        assert_eq!(
            DeliveryOutcome {
                sent: 1,
                failed: 0,
                cleaned: 1
            },
            outcome
        );
        let remaining = fixture.dispatcher.registry().list(&u1).await;
        assert_eq!(1, remaining.len());
        assert_eq!("https://push/b", remaining[0].endpoint.as_str());
        assert_eq!(1, fixture.transport.attempts_to("https://push/b"));
    }

    #[tokio::test]
    async fn failed_removal_counts_as_failed_not_cleaned() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/b").await;
        fixture.transport.set_reply("https://push/a", Reply::Status(410));
        let subscriptions = fixture
            .dispatcher
            .registry()
            .list(&RecipientId::new_unchecked("u1"))
            .await;
        fixture.pool.clone().close().await;

        let outcome = fixture
            .dispatcher
            .deliver_all(&subscriptions, &PushPayload::new("t", "b").serialize())
            .await;

        assert_eq!(
            DeliveryOutcome {
                sent: 1,
                failed: 1,
                cleaned: 0
            },
            outcome
        );
        assert_eq!(
            1,
            fixture.observer.count(|e| matches!(
                e,
                EngineEvent::StoreFallback {
                    operation: StoreOperation::RemoveSubscription,
                    fallback: Fallback::ReportedFailure,
                }
            ))
        );
    }

    #[tokio::test]
    async fn transient_failures_do_not_short_circuit() {
        test_utils::set_up();
        let fixture = Fixture::new();
        for endpoint in ["https://push/a", "https://push/b", "https://push/c"] {
            subscribe(fixture.dispatcher.registry(), "u1", endpoint).await;
        }
        fixture.transport.set_reply("https://push/a", Reply::Status(500));
        fixture.transport.set_reply("https://push/b", Reply::Status(429));

        let u1 = RecipientId::new_unchecked("u1");
        let outcome = fixture.dispatcher.send(&u1, &PushPayload::new("t", "b")).await;

        assert_eq!(
            DeliveryOutcome {
                sent: 1,
                failed: 2,
                cleaned: 0
            },
            outcome
        );
        assert_eq!(3, fixture.dispatcher.registry().list(&u1).await.len());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient_and_keeps_subscription() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/stuck").await;
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/ok").await;
        fixture.transport.set_reply("https://push/stuck", Reply::Hang);

        let u1 = RecipientId::new_unchecked("u1");
        let outcome = fixture.dispatcher.send(&u1, &PushPayload::new("t", "b")).await;

        assert_eq!(
            DeliveryOutcome {
                sent: 1,
                failed: 1,
                cleaned: 0
            },
            outcome
        );
        assert_eq!(2, fixture.dispatcher.registry().list(&u1).await.len());
        let stuck = Endpoint::new_unchecked("https://push/stuck");
        let stuck_result = fixture.observer.events().into_iter().find_map(|e| match e {
            EngineEvent::DeliveryAttempted {
                endpoint, result, ..
            } if endpoint == stuck => Some(result),
            _ => None,
        });
        assert_matches!(
            stuck_result,
            Some(AttemptResult::Failed(FailureClass::Transient))
        );
    }

    #[tokio::test]
    async fn sweep_removes_gone_endpoints_with_probe_payload() {
        test_utils::set_up();
        let fixture = Fixture::new();
        subscribe(fixture.dispatcher.registry(), "u1", "https://push/a").await;
        subscribe(fixture.dispatcher.registry(), "u2", "https://push/b").await;
        subscribe(fixture.dispatcher.registry(), "u2", "https://push/c").await;
        fixture.transport.set_reply("https://push/b", Reply::Status(404));
        fixture.transport.set_reply("https://push/c", Reply::Status(503));

        assert_eq!(1, fixture.dispatcher.sweep_invalid().await);

        let remaining = fixture.dispatcher.registry().list_all().await;
        assert_eq!(2, remaining.len());
        let probe = PushPayload::probe().serialize();
        assert!(fixture.transport.sent().iter().all(|push| push.payload == probe));
        assert_eq!(
            1,
            fixture.observer.count(|e| matches!(
                e,
                EngineEvent::SweepFinished {
                    probed: 3,
                    cleaned: 1
                }
            ))
        );
    }
}
