//! Structured observability hooks.
//!
//! Engine components report what they did through an injected [`Observer`].
//! [`TracingObserver`] turns the events into log lines.
use crate::{
    DeliveryOutcome, Endpoint, EventId, RecipientId, TrackingKey, transport::FailureClass,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StoreOperation {
    ListSubscriptions,
    IsSent,
    MarkSent,
    RemoveSubscription,
    UpsertSubscription,
    History,
    DueEvents,
    AppendBroadcast,
    ListBroadcasts,
}

/// Safe default that was substituted for a failed store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Fallback {
    EmptyList,
    /// `is_sent` answered `true` to avoid a duplicate notification.
    AssumeSent,
    ReportedFailure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptResult {
    Sent,
    Failed(FailureClass),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    DeliveryAttempted {
        recipient_id: RecipientId,
        endpoint: Endpoint,
        result: AttemptResult,
    },
    SubscriptionRemoved {
        recipient_id: RecipientId,
        endpoint: Endpoint,
    },
    StoreFallback {
        operation: StoreOperation,
        fallback: Fallback,
    },
    NotificationSkipped {
        tracking_key: TrackingKey,
    },
    NotificationMarked {
        tracking_key: TrackingKey,
        recipient_id: RecipientId,
    },
    /// Delivery of a due event reached nobody, the event stays a candidate.
    NotificationDeferred {
        event_id: EventId,
        outcome: DeliveryOutcome,
    },
    ScanFinished {
        candidates: usize,
        processed: usize,
    },
    SweepFinished {
        probed: usize,
        cleaned: usize,
    },
    BroadcastSent {
        sent: u32,
        failed: u32,
        total: u32,
    },
}

pub trait Observer: Send + Sync + 'static {
    fn on_event(&self, event: &EngineEvent);
}

impl<O: Observer + ?Sized> Observer for Arc<O> {
    fn on_event(&self, event: &EngineEvent) {
        self.as_ref().on_event(event);
    }
}

/// Forwards engine events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::DeliveryAttempted {
                recipient_id,
                endpoint,
                result: AttemptResult::Sent,
            } => {
                debug!(%recipient_id, %endpoint, "Delivered");
            }
            EngineEvent::DeliveryAttempted {
                recipient_id,
                endpoint,
                result: AttemptResult::Failed(class),
            } => {
                debug!(%recipient_id, %endpoint, class = <&'static str>::from(class), "Delivery failed");
            }
            EngineEvent::SubscriptionRemoved {
                recipient_id,
                endpoint,
            } => {
                info!(%recipient_id, %endpoint, "Removed defunct subscription");
            }
            EngineEvent::StoreFallback {
                operation,
                fallback,
            } => {
                warn!(
                    operation = <&'static str>::from(operation),
                    fallback = <&'static str>::from(fallback),
                    "Store unavailable, using fallback"
                );
            }
            EngineEvent::NotificationSkipped { tracking_key } => {
                debug!(%tracking_key, "Already sent, skipping");
            }
            EngineEvent::NotificationMarked {
                tracking_key,
                recipient_id,
            } => {
                info!(%tracking_key, %recipient_id, "Marked as sent");
            }
            EngineEvent::NotificationDeferred { event_id, outcome } => {
                debug!(%event_id, ?outcome, "Nothing delivered, will retry on next scan");
            }
            EngineEvent::ScanFinished {
                candidates,
                processed,
            } => {
                if *processed > 0 {
                    info!(candidates, processed, "Scan finished");
                } else {
                    debug!(candidates, processed, "Scan finished");
                }
            }
            EngineEvent::SweepFinished { probed, cleaned } => {
                info!(probed, cleaned, "Sweep finished");
            }
            EngineEvent::BroadcastSent {
                sent,
                failed,
                total,
            } => {
                info!(sent, failed, total, "Broadcast sent");
            }
        }
    }
}
