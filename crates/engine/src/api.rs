//! Inbound operations for the operator CLI and any embedding service. Input is validated here,
//! the components behind it assume well-formed identifiers.
use crate::{broadcast::BroadcastLog, tracker::DeliveryTracker};
use concepts::{
    BroadcastMessage, BroadcastOutcome, DeliveryRecord, DeviceId, RecipientId, RecipientSelector,
    StrVariant, TrackingKey, time::ClockFn,
};
use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Equivalent of HTTP 400.
    #[error("invalid input: {0}")]
    InvalidInput(StrVariant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentStatus {
    pub sent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkStatus {
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub notifications: Vec<DeliveryRecord>,
}

/// Either the literal `"all"` or a list of recipient ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    Keyword(String),
    Ids(Vec<String>),
}

impl TryFrom<Recipients> for RecipientSelector {
    type Error = ApiError;

    fn try_from(value: Recipients) -> Result<Self, Self::Error> {
        match value {
            Recipients::Keyword(keyword) if keyword == "all" => Ok(RecipientSelector::All),
            Recipients::Keyword(other) => Err(ApiError::InvalidInput(StrVariant::from(format!(
                "recipients must be \"all\" or a list of ids, got \"{other}\""
            )))),
            Recipients::Ids(ids) if ids.is_empty() => Err(ApiError::InvalidInput(
                StrVariant::Static("recipient list must not be empty"),
            )),
            Recipients::Ids(ids) => ids
                .into_iter()
                .map(|id| parse_recipient_id(&id))
                .collect::<Result<Vec<_>, _>>()
                .map(RecipientSelector::Explicit),
        }
    }
}

fn parse_recipient_id(recipient_id: &str) -> Result<RecipientId, ApiError> {
    RecipientId::new(recipient_id).map_err(|err| {
        ApiError::InvalidInput(StrVariant::from(format!("invalid recipient id - {err}")))
    })
}

fn parse_tracking_key<S: AsRef<str>>(tracking_parts: &[S]) -> Result<TrackingKey, ApiError> {
    TrackingKey::from_parts(tracking_parts).map_err(|err| {
        ApiError::InvalidInput(StrVariant::from(format!("invalid tracking key - {err}")))
    })
}

#[derive(Clone)]
pub struct NotificationApi<C: ClockFn> {
    tracker: DeliveryTracker<C>,
    broadcast_log: BroadcastLog<C>,
    history_limit: u32,
}

impl<C: ClockFn> NotificationApi<C> {
    #[must_use]
    pub fn new(
        tracker: DeliveryTracker<C>,
        broadcast_log: BroadcastLog<C>,
        history_limit: u32,
    ) -> Self {
        Self {
            tracker,
            broadcast_log,
            history_limit,
        }
    }

    #[instrument(level = Level::DEBUG, skip(self, tracking_parts))]
    pub async fn check_sent<S: AsRef<str>>(
        &self,
        recipient_id: &str,
        tracking_parts: &[S],
    ) -> Result<SentStatus, ApiError> {
        parse_recipient_id(recipient_id)?;
        let tracking_key = parse_tracking_key(tracking_parts)?;
        Ok(SentStatus {
            sent: self.tracker.is_sent(&tracking_key).await,
        })
    }

    #[instrument(level = Level::DEBUG, skip(self, tracking_parts))]
    pub async fn mark_sent<S: AsRef<str>>(
        &self,
        recipient_id: &str,
        tracking_parts: &[S],
        device_id: Option<&str>,
    ) -> Result<MarkStatus, ApiError> {
        let recipient_id = parse_recipient_id(recipient_id)?;
        let tracking_key = parse_tracking_key(tracking_parts)?;
        let device_id = device_id
            .map(|device_id| {
                DeviceId::new(device_id).map_err(|err| {
                    ApiError::InvalidInput(StrVariant::from(format!("invalid device id - {err}")))
                })
            })
            .transpose()?;
        Ok(MarkStatus {
            ok: self
                .tracker
                .mark_sent(&tracking_key, &recipient_id, device_id.as_ref())
                .await,
        })
    }

    #[instrument(level = Level::DEBUG, skip(self))]
    pub async fn history(&self, recipient_id: &str) -> Result<HistoryResponse, ApiError> {
        let recipient_id = parse_recipient_id(recipient_id)?;
        Ok(HistoryResponse {
            notifications: self
                .tracker
                .history(&recipient_id, Some(self.history_limit))
                .await,
        })
    }

    #[instrument(level = Level::DEBUG, skip(self, text))]
    pub async fn broadcast(
        &self,
        text: &str,
        recipients: Recipients,
        issued_by: &str,
    ) -> Result<BroadcastOutcome, ApiError> {
        if text.trim().is_empty() {
            return Err(ApiError::InvalidInput(StrVariant::Static(
                "broadcast text must not be empty",
            )));
        }
        if issued_by.trim().is_empty() {
            return Err(ApiError::InvalidInput(StrVariant::Static(
                "issuer must not be empty",
            )));
        }
        let recipient_selector = RecipientSelector::try_from(recipients)?;
        Ok(self
            .broadcast_log
            .broadcast(text, recipient_selector, issued_by)
            .await)
    }

    pub async fn broadcast_log(&self, limit: u32) -> Vec<BroadcastMessage> {
        self.broadcast_log.recent(limit).await
    }
}
