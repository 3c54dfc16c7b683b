use super::{Opened, print_json};
use crate::args::Subscription;
use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use concepts::{Endpoint, RecipientId, time::ClockFn as _, time::Now};
use serde::Serialize;

/// Subscription without its key material.
#[derive(Debug, Serialize)]
struct SubscriptionView<'a> {
    recipient_id: &'a RecipientId,
    endpoint: &'a Endpoint,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct Done {
    ok: bool,
}

pub(crate) async fn subscription(
    opened: &Opened,
    command: Subscription,
) -> Result<(), anyhow::Error> {
    let registry = &opened.engine.registry;
    match command {
        Subscription::Add {
            recipient_id,
            endpoint,
            auth,
            p256dh,
        } => {
            let recipient_id = RecipientId::new(recipient_id).context("invalid recipient id")?;
            let endpoint = Endpoint::new(endpoint).context("invalid endpoint")?;
            if !registry
                .upsert(recipient_id, endpoint, auth, p256dh, Now.now())
                .await
            {
                bail!("cannot store the subscription");
            }
            print_json(&Done { ok: true })
        }
        Subscription::Remove {
            recipient_id,
            endpoint,
        } => {
            let recipient_id = RecipientId::new(recipient_id).context("invalid recipient id")?;
            let endpoint = Endpoint::new(endpoint).context("invalid endpoint")?;
            let ok = registry.remove(&recipient_id, &endpoint).await;
            print_json(&Done { ok })
        }
        Subscription::List { recipient_id } => {
            let subscriptions = if let Some(recipient_id) = recipient_id {
                let recipient_id =
                    RecipientId::new(recipient_id).context("invalid recipient id")?;
                registry.list(&recipient_id).await
            } else {
                registry.list_all().await
            };
            let views: Vec<_> = subscriptions
                .iter()
                .map(|subscription| SubscriptionView {
                    recipient_id: &subscription.recipient_id,
                    endpoint: &subscription.endpoint,
                    created_at: subscription.created_at,
                })
                .collect();
            print_json(&views)
        }
    }
}

#[derive(Debug, Serialize)]
struct SweepResult {
    cleaned: u32,
}

pub(crate) async fn sweep(opened: &Opened) -> Result<(), anyhow::Error> {
    let cleaned = opened.engine.dispatcher.sweep_invalid().await;
    print_json(&SweepResult { cleaned })
}
