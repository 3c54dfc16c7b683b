//! Outbound delivery seam.
//!
//! Failures are classified exactly once, where the transport sees the
//! response status, and travel as [`SendError`] through the rest of the engine.
use crate::{SerializedPayload, StrVariant, Subscription};
use async_trait::async_trait;

/// What the engine does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FailureClass {
    /// Endpoint is gone or unregistered, the subscription must be deleted.
    Permanent,
    /// Anything else, including rate limiting and timeouts. Retry later.
    Transient,
}

impl FailureClass {
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            404 | 410 => FailureClass::Permanent,
            _ => FailureClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("endpoint is gone, status {status}")]
    Permanent { status: u16 },
    #[error("transient failure, status {status:?}: {reason}")]
    Transient {
        status: Option<u16>,
        reason: StrVariant,
    },
}

impl SendError {
    /// Classifies a non-success status reported by the push service.
    #[must_use]
    pub fn from_status(status: u16, reason: StrVariant) -> Self {
        match FailureClass::from_status(status) {
            FailureClass::Permanent => SendError::Permanent { status },
            FailureClass::Transient => SendError::Transient {
                status: Some(status),
                reason,
            },
        }
    }

    #[must_use]
    pub fn timeout() -> Self {
        SendError::Transient {
            status: None,
            reason: StrVariant::Static("timed out"),
        }
    }

    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            SendError::Permanent { .. } => FailureClass::Permanent,
            SendError::Transient { .. } => FailureClass::Transient,
        }
    }
}

#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Attempts exactly one delivery.
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &SerializedPayload,
    ) -> Result<(), SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(404, FailureClass::Permanent)]
    #[case(410, FailureClass::Permanent)]
    #[case(400, FailureClass::Transient)]
    #[case(413, FailureClass::Transient)]
    #[case(429, FailureClass::Transient)]
    #[case(500, FailureClass::Transient)]
    #[case(503, FailureClass::Transient)]
    fn status_classification(#[case] status: u16, #[case] expected: FailureClass) {
        assert_eq!(expected, FailureClass::from_status(status));
        assert_eq!(
            expected,
            SendError::from_status(status, StrVariant::empty()).class()
        );
    }

    #[test]
    fn timeout_is_transient() {
        assert_eq!(FailureClass::Transient, SendError::timeout().class());
    }
}
