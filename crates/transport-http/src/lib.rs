//! Delivery through a push gateway.
//!
//! The gateway owns the Web Push encryption and VAPID signing. Herald posts the
//! subscription credentials and the payload as JSON. The gateway relays the status
//! code it received from the push service in the `push_status` field of a JSON body,
//! e.g. `{"push_status": 410}`. Only that field decides whether a subscription is gone,
//! a gateway error without it is always transient.
use async_trait::async_trait;
use concepts::{
    SerializedPayload, StrVariant, Subscription,
    transport::{PushTransport, SendError},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{Level, debug, info, instrument, trace};
use url::Url;

/// Value of the Web Push `Urgency` header.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    serde::Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Urgency {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: Url,
    pub request_timeout: Duration,
    /// How long the push service keeps an undelivered message.
    pub ttl: Duration,
    pub urgency: Urgency,
}

#[derive(Serialize)]
struct GatewayRequest<'a> {
    subscription: GatewaySubscription<'a>,
    payload: &'a str,
}

#[derive(Serialize)]
struct GatewaySubscription<'a> {
    endpoint: &'a str,
    keys: SubscriptionKeys<'a>,
}

#[derive(Serialize)]
struct SubscriptionKeys<'a> {
    auth: &'a str,
    p256dh: &'a str,
}

#[derive(Deserialize)]
struct GatewayResponse {
    push_status: u16,
}

pub struct GatewayTransport {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayTransport {
    pub fn new(config: GatewayConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl PushTransport for GatewayTransport {
    #[instrument(level = Level::DEBUG, skip_all, fields(endpoint = %subscription.endpoint))]
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &SerializedPayload,
    ) -> Result<(), SendError> {
        let request = GatewayRequest {
            subscription: GatewaySubscription {
                endpoint: subscription.endpoint.as_str(),
                keys: SubscriptionKeys {
                    auth: &subscription.auth_secret,
                    p256dh: &subscription.encryption_key,
                },
            },
            payload: payload.as_str(),
        };
        let response = self
            .client
            .post(self.config.url.clone())
            .header("TTL", self.config.ttl.as_secs())
            .header("Urgency", self.config.urgency.to_string())
            .json(&request)
            .send()
            .await;
        let response = match response {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                debug!("Gateway timed out");
                return Err(SendError::timeout());
            }
            Err(err) => {
                debug!("Gateway unreachable - {err:?}");
                return Err(SendError::Transient {
                    status: None,
                    reason: StrVariant::from(err.to_string()),
                });
            }
        };
        let status = response.status();
        trace!(%status, "Gateway responded");
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<GatewayResponse>(&body) {
            Ok(GatewayResponse { push_status }) if (200..300).contains(&push_status) => Ok(()),
            Ok(GatewayResponse { push_status }) => Err(SendError::from_status(
                push_status,
                StrVariant::from(format!("push service answered {push_status}")),
            )),
            Err(_) if status.is_success() => Ok(()),
            Err(_) => {
                debug!(%status, "Gateway failed without a push status");
                Err(SendError::Transient {
                    status: None,
                    reason: StrVariant::from(format!("gateway answered {status}: {body}")),
                })
            }
        }
    }
}

/// Accepts every push without sending it anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunTransport;

#[async_trait]
impl PushTransport for DryRunTransport {
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &SerializedPayload,
    ) -> Result<(), SendError> {
        info!(
            recipient_id = %subscription.recipient_id,
            endpoint = %subscription.endpoint,
            %payload,
            "Dry run, not sending"
        );
        Ok(())
    }
}
