use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    borrow::Borrow,
    fmt::{Debug, Display},
    hash::Hash,
    marker::PhantomData,
    ops::Deref,
    str::FromStr,
    sync::Arc,
};

pub mod observer;
#[cfg(feature = "rusqlite")]
mod rusqlite_ext;
pub mod storage;
pub mod time;
pub mod transport;

pub use prefixed_ulid::BroadcastId;

#[derive(Clone, Eq)]
pub enum StrVariant {
    Static(&'static str),
    Arc(Arc<str>),
}

impl StrVariant {
    #[must_use]
    pub const fn empty() -> StrVariant {
        StrVariant::Static("")
    }
}

impl From<String> for StrVariant {
    fn from(value: String) -> Self {
        StrVariant::Arc(Arc::from(value))
    }
}

impl From<&'static str> for StrVariant {
    fn from(value: &'static str) -> Self {
        StrVariant::Static(value)
    }
}

impl PartialEq for StrVariant {
    fn eq(&self, other: &Self) -> bool {
        self.deref() == other.deref()
    }
}

impl Hash for StrVariant {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.deref().hash(state);
    }
}

impl Display for StrVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.deref())
    }
}

impl Debug for StrVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self, f)
    }
}

impl Deref for StrVariant {
    type Target = str;
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Arc(v) => v,
            Self::Static(v) => v,
        }
    }
}

const MAX_IDENTIFIER_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierParseError {
    #[error("identifier must not be empty")]
    Empty,
    #[error("identifier must not be longer than {MAX_IDENTIFIER_LEN} characters, got {0}")]
    TooLong(usize),
    #[error("identifier must not contain whitespace or control characters")]
    InvalidCharacter,
}

/// Opaque, validated string identifier. The marker type keeps identifiers
/// of different entities from being mixed up.
pub struct Identifier<T> {
    value: Arc<str>,
    phantom_data: PhantomData<fn(T) -> T>,
}

impl<T> Identifier<T> {
    pub fn new(value: impl Into<String>) -> Result<Self, IdentifierParseError> {
        let value: String = value.into();
        if value.is_empty() {
            return Err(IdentifierParseError::Empty);
        }
        if value.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentifierParseError::TooLong(value.len()));
        }
        if value
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(IdentifierParseError::InvalidCharacter);
        }
        Ok(Self {
            value: Arc::from(value),
            phantom_data: PhantomData,
        })
    }

    /// Panics on invalid input. Meant for constants and tests.
    #[must_use]
    pub fn new_unchecked(value: &str) -> Self {
        Self::new(value).unwrap_or_else(|err| panic!("invalid identifier `{value}` - {err}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

mod identifier_impls {
    use super::{
        Borrow, Debug, Deref, Deserialize, Display, FromStr, Hash, Identifier,
        IdentifierParseError, PhantomData, Serialize,
    };

    impl<T> Clone for Identifier<T> {
        fn clone(&self) -> Self {
            Self {
                value: self.value.clone(),
                phantom_data: PhantomData,
            }
        }
    }

    impl<T> PartialEq for Identifier<T> {
        fn eq(&self, other: &Self) -> bool {
            self.value == other.value
        }
    }

    impl<T> Eq for Identifier<T> {}

    impl<T> Hash for Identifier<T> {
        fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
            self.value.hash(state);
        }
    }

    impl<T> PartialOrd for Identifier<T> {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }

    impl<T> Ord for Identifier<T> {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.value.cmp(&other.value)
        }
    }

    impl<T> Display for Identifier<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(&self.value)
        }
    }

    impl<T> Debug for Identifier<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            Display::fmt(&self, f)
        }
    }

    impl<T> Deref for Identifier<T> {
        type Target = str;

        fn deref(&self) -> &Self::Target {
            &self.value
        }
    }

    impl<T> Borrow<str> for Identifier<T> {
        fn borrow(&self) -> &str {
            &self.value
        }
    }

    impl<T> FromStr for Identifier<T> {
        type Err = IdentifierParseError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::new(s)
        }
    }

    impl<T> TryFrom<String> for Identifier<T> {
        type Error = IdentifierParseError;

        fn try_from(value: String) -> Result<Self, Self::Error> {
            Self::new(value)
        }
    }

    impl<T> Serialize for Identifier<T> {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&self.value)
        }
    }

    impl<'de, T> Deserialize<'de> for Identifier<T> {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let value = String::deserialize(deserializer)?;
            Self::new(value).map_err(serde::de::Error::custom)
        }
    }
}

pub mod marker {
    pub struct Recipient;
    pub struct Endpoint;
    pub struct Event;
    pub struct EventKind;
    pub struct Device;
    pub struct NotificationKind;
}

pub type RecipientId = Identifier<marker::Recipient>;
/// Opaque transport address of a single device subscription.
pub type Endpoint = Identifier<marker::Endpoint>;
pub type EventId = Identifier<marker::Event>;
pub type EventKind = Identifier<marker::EventKind>;
pub type DeviceId = Identifier<marker::Device>;
pub type NotificationKind = Identifier<marker::NotificationKind>;

pub mod prefixed_ulid {
    use serde_str::{deserialize_from_str, serialize_display};
    use std::{fmt::Display, str::FromStr};

    const BROADCAST_PREFIX: &str = "brd";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct BroadcastId(ulid::Ulid);

    impl BroadcastId {
        #[must_use]
        pub fn generate() -> Self {
            Self(ulid::Ulid::new())
        }

        #[must_use]
        pub fn from_parts(timestamp_ms: u64, random: u128) -> Self {
            Self(ulid::Ulid::from_parts(timestamp_ms, random))
        }
    }

    impl Display for BroadcastId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{BROADCAST_PREFIX}_{}", self.0)
        }
    }

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    pub enum PrefixedUlidParseError {
        #[error("wrong prefix, expected `{BROADCAST_PREFIX}_`")]
        WrongPrefix,
        #[error("cannot parse ulid suffix - {0}")]
        CannotParseUlid(#[from] ulid::DecodeError),
    }

    impl FromStr for BroadcastId {
        type Err = PrefixedUlidParseError;

        fn from_str(input: &str) -> Result<Self, Self::Err> {
            let suffix = input
                .strip_prefix(BROADCAST_PREFIX)
                .and_then(|rest| rest.strip_prefix('_'))
                .ok_or(PrefixedUlidParseError::WrongPrefix)?;
            Ok(Self(ulid::Ulid::from_string(suffix)?))
        }
    }

    impl serde::Serialize for BroadcastId {
        fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serialize_display(self, serializer)
        }
    }

    impl<'de> serde::Deserialize<'de> for BroadcastId {
        fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            deserialize_from_str(deserializer)
        }
    }

    mod serde_str {
        use std::{fmt::Display, str::FromStr};

        pub(super) fn serialize_display<T: Display, S: serde::Serializer>(
            value: &T,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            serializer.collect_str(value)
        }

        pub(super) fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
        where
            T: FromStr,
            T::Err: Display,
            D: serde::Deserializer<'de>,
        {
            let value = <String as serde::Deserialize>::deserialize(deserializer)?;
            value.parse().map_err(serde::de::Error::custom)
        }
    }
}

/// A single device registration of a recipient.
#[derive(Clone, derive_more::Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub recipient_id: RecipientId,
    pub endpoint: Endpoint,
    #[debug(skip)]
    pub auth_secret: String,
    #[debug(skip)]
    pub encryption_key: String,
    pub created_at: DateTime<Utc>,
}

pub const TRACKING_KEY_DELIMITER: char = '_';
const MAX_TRACKING_KEY_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackingKeyError {
    #[error("tracking key needs at least one part")]
    NoParts,
    #[error("tracking key part {idx} is blank")]
    BlankPart { idx: usize },
    #[error("tracking key must not be longer than {MAX_TRACKING_KEY_LEN} characters, got {0}")]
    TooLong(usize),
}

/// Deterministic identifier of one logical notification. Every caller
/// computing the same notification must end up with the same key, it is
/// the primary key of the delivery ledger.
#[derive(
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::Display,
    derive_more::Debug,
    Serialize,
    Deserialize,
)]
#[display("{_0}")]
#[debug("{_0}")]
#[serde(try_from = "String", into = "String")]
pub struct TrackingKey(Arc<str>);

impl TrackingKey {
    pub fn from_parts<S: AsRef<str>>(parts: &[S]) -> Result<Self, TrackingKeyError> {
        if parts.is_empty() {
            return Err(TrackingKeyError::NoParts);
        }
        let mut key = String::new();
        for (idx, part) in parts.iter().enumerate() {
            let part = part.as_ref().trim();
            if part.is_empty() {
                return Err(TrackingKeyError::BlankPart { idx });
            }
            if idx > 0 {
                key.push(TRACKING_KEY_DELIMITER);
            }
            key.push_str(part);
        }
        if key.len() > MAX_TRACKING_KEY_LEN {
            return Err(TrackingKeyError::TooLong(key.len()));
        }
        Ok(Self(Arc::from(key)))
    }

    /// `<kind>_<event_id>`
    #[must_use]
    pub fn for_event(kind: &NotificationKind, event_id: &EventId) -> Self {
        Self(Arc::from(format!(
            "{kind}{TRACKING_KEY_DELIMITER}{event_id}"
        )))
    }

    /// `cycle_<cycle_id>_<deadline>`
    pub fn for_cycle_deadline(cycle_id: &str, deadline: &str) -> Result<Self, TrackingKeyError> {
        Self::from_parts(&["cycle", cycle_id, deadline])
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TrackingKey {
    type Error = TrackingKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_parts(&[value])
    }
}

impl From<TrackingKey> for String {
    fn from(value: TrackingKey) -> Self {
        value.0.to_string()
    }
}

/// Idempotency ledger entry. Its existence means the notification was issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub tracking_key: TrackingKey,
    pub recipient_id: RecipientId,
    pub sent_at: DateTime<Utc>,
    pub device_id: Option<DeviceId>,
}

/// Read-only view of an externally owned business event, e.g. an appointment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessEvent {
    pub id: EventId,
    pub owner_id: RecipientId,
    pub kind: EventKind,
    pub end_time: DateTime<Utc>,
    /// Sub-flag selecting between the two prompt variants.
    pub has_outcome: bool,
    pub answered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSelector {
    All,
    Explicit(Vec<RecipientId>),
}

impl Display for RecipientSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipientSelector::All => f.write_str("all"),
            RecipientSelector::Explicit(ids) => {
                f.write_str("[")?;
                for (idx, id) in ids.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{id}")?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Audit entry of a manually triggered broadcast. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: BroadcastId,
    pub text: String,
    pub recipient_selector: RecipientSelector,
    pub sent_count: u32,
    pub failed_count: u32,
    pub total_targeted: u32,
    pub issued_by: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub silent: bool,
}

impl PushPayload {
    #[must_use]
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            url: None,
            tag: None,
            silent: false,
        }
    }

    /// Silent payload used for probing subscriptions during maintenance sweeps.
    #[must_use]
    pub fn probe() -> Self {
        Self {
            title: String::new(),
            body: String::new(),
            url: None,
            tag: Some("probe".to_string()),
            silent: true,
        }
    }

    #[must_use]
    pub fn serialize(&self) -> SerializedPayload {
        SerializedPayload(Arc::from(
            serde_json::to_string(self).expect("PushPayload contains only strings and bools"),
        ))
    }
}

/// Payload serialized once and shared by all delivery attempts.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub struct SerializedPayload(Arc<str>);

impl SerializedPayload {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Per-recipient fan-out result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub sent: u32,
    pub failed: u32,
    pub cleaned: u32,
}

impl DeliveryOutcome {
    /// At least one subscription accepted the payload.
    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.sent > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastOutcome {
    pub sent: u32,
    pub failed: u32,
    pub total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case(&["post_sale", "e42"], "post_sale_e42")]
    #[case(&["cycle", "c7", "2024-05-01"], "cycle_c7_2024-05-01")]
    #[case(&[" trimmed ", "x"], "trimmed_x")]
    fn tracking_key_from_parts(#[case] parts: &[&str], #[case] expected: &str) {
        let key = TrackingKey::from_parts(parts).unwrap();
        assert_eq!(expected, key.as_str());
    }

    #[test]
    fn tracking_key_for_event_matches_from_parts() {
        let kind = NotificationKind::new_unchecked("post_sale");
        let event_id = EventId::new_unchecked("e42");
        assert_eq!(
            TrackingKey::from_parts(&["post_sale", "e42"]).unwrap(),
            TrackingKey::for_event(&kind, &event_id)
        );
    }

    #[test]
    fn tracking_key_for_cycle_deadline() {
        let key = TrackingKey::for_cycle_deadline("42", "2024-06-30").unwrap();
        assert_eq!("cycle_42_2024-06-30", key.as_str());
    }

    #[test]
    fn tracking_key_rejects_blank_parts() {
        assert_matches!(
            TrackingKey::from_parts::<&str>(&[]),
            Err(TrackingKeyError::NoParts)
        );
        assert_matches!(
            TrackingKey::from_parts(&["kind", "  "]),
            Err(TrackingKeyError::BlankPart { idx: 1 })
        );
    }

    #[test]
    fn tracking_key_rejects_oversized_keys() {
        let long = "x".repeat(MAX_TRACKING_KEY_LEN + 1);
        assert_matches!(
            TrackingKey::from_parts(&[long]),
            Err(TrackingKeyError::TooLong(_))
        );
    }

    #[rstest]
    #[case("", IdentifierParseError::Empty)]
    #[case("has space", IdentifierParseError::InvalidCharacter)]
    fn identifier_validation(#[case] input: &str, #[case] expected: IdentifierParseError) {
        assert_eq!(Err(expected), RecipientId::new(input).map(|_| ()));
    }

    #[test]
    fn identifier_serde_is_transparent() {
        let id = RecipientId::new_unchecked("u1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!("\"u1\"", json);
        let back: RecipientId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
        assert!(serde_json::from_str::<RecipientId>("\"\"").is_err());
    }

    #[test]
    fn broadcast_id_display_and_parse() {
        let id = BroadcastId::generate();
        let displayed = id.to_string();
        assert!(displayed.starts_with("brd_"));
        assert_eq!(id, displayed.parse().unwrap());
        assert_matches!(
            "exe_01H".parse::<BroadcastId>(),
            Err(prefixed_ulid::PrefixedUlidParseError::WrongPrefix)
        );
    }

    #[test]
    fn subscription_debug_hides_credentials() {
        let subscription = Subscription {
            recipient_id: RecipientId::new_unchecked("u1"),
            endpoint: Endpoint::new_unchecked("https://push.example/abc"),
            auth_secret: "secret-auth".to_string(),
            encryption_key: "secret-key".to_string(),
            created_at: Utc::now(),
        };
        let debug = format!("{subscription:?}");
        assert!(!debug.contains("secret-auth"));
        assert!(!debug.contains("secret-key"));
    }

    #[test]
    fn probe_payload_is_silent() {
        let serialized = PushPayload::probe().serialize();
        let value: serde_json::Value = serde_json::from_str(serialized.as_str()).unwrap();
        assert_eq!(serde_json::Value::Bool(true), value["silent"]);
        assert!(value.get("url").is_none());
    }
}
