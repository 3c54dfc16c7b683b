use async_trait::async_trait;
use concepts::{
    Endpoint, SerializedPayload, StrVariant, Subscription,
    transport::{PushTransport, SendError},
};
use hashbrown::HashMap;
use std::sync::{Arc, Mutex};

/// How the [`ScriptedTransport`] answers a send to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Accept,
    Status(u16),
    /// Never completes, the caller's timeout must fire.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPush {
    pub endpoint: Endpoint,
    pub payload: SerializedPayload,
}

/// Transport double answering per endpoint. Unscripted endpoints accept.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    replies: Arc<Mutex<HashMap<Endpoint, Reply>>>,
    sent: Arc<Mutex<Vec<SentPush>>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reply(&self, endpoint: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(Endpoint::new_unchecked(endpoint), reply);
    }

    /// Every attempt in the order it was made, including failed ones.
    #[must_use]
    pub fn sent(&self) -> Vec<SentPush> {
        self.sent.lock().unwrap().clone()
    }

    #[must_use]
    pub fn attempts_to(&self, endpoint: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|push| push.endpoint.as_str() == endpoint)
            .count()
    }
}

#[async_trait]
impl PushTransport for ScriptedTransport {
    async fn send(
        &self,
        subscription: &Subscription,
        payload: &SerializedPayload,
    ) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(SentPush {
            endpoint: subscription.endpoint.clone(),
            payload: payload.clone(),
        });
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&subscription.endpoint)
            .copied()
            .unwrap_or(Reply::Accept);
        match reply {
            Reply::Accept => Ok(()),
            Reply::Status(status) => Err(SendError::from_status(
                status,
                StrVariant::Static("scripted"),
            )),
            Reply::Hang => std::future::pending().await,
        }
    }
}
