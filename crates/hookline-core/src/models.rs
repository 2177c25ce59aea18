//! Domain models and strongly-typed identifiers.
//!
//! `Webhook` is configuration owned by the admin API and only read here.
//! `WebhookEvent` is the engine-owned record of one row change queued for
//! one webhook; its `attempts`, `next_retry_at` and `error_message` columns
//! are the whole retry state machine. `WebhookDelivery` is an optional
//! audit row written around each send.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Default per-attempt HTTP timeout when a webhook carries none.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                <Uuid as sqlx::Decode<PgDb>>::decode(value).map(Self)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a configured webhook.
    ///
    /// This is also the unit of work on the delivery queue: workers receive
    /// webhook ids and fetch that webhook's due events themselves.
    WebhookId
);

uuid_id!(
    /// Identifier of one queued change event.
    EventId
);

/// Row-change operation that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// A row was inserted.
    Insert,
    /// A row was updated.
    Update,
    /// A row was deleted.
    Delete,
}

impl Operation {
    /// Wire and storage name of the operation.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Self::Insert),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("invalid operation: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for Operation {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for Operation {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

/// One entry of a webhook's subscription list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSubscription {
    /// Table name, `schema.table`, or `*` for every table.
    pub table: String,
    /// Operations of interest. An empty list matches every operation.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl EventSubscription {
    /// Wildcard subscription to every operation on every table.
    pub fn all() -> Self {
        Self { table: "*".to_string(), operations: Vec::new() }
    }

    /// Returns true if a change to `schema.table` via `operation` matches.
    pub fn matches(&self, schema: &str, table: &str, operation: Operation) -> bool {
        let table_matches = self.table == "*"
            || self.table == table
            || self.table.split_once('.').is_some_and(|(s, t)| s == schema && t == table);

        table_matches && (self.operations.is_empty() || self.operations.contains(&operation))
    }
}

/// Webhook configuration as read by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Webhook {
    /// Unique identifier.
    pub id: WebhookId,

    /// Human-readable name.
    pub name: String,

    /// Destination URL.
    pub url: String,

    /// Shared secret for payload signing. `None` disables signing.
    pub secret: Option<String>,

    /// Static headers added to every delivery.
    pub headers: Json<HashMap<String, String>>,

    /// Tables and operations this webhook listens to.
    pub events: Json<Vec<EventSubscription>>,

    /// Maximum delivery attempts before an event is terminally failed.
    pub max_retries: i32,

    /// Linear backoff unit in seconds.
    pub retry_backoff_seconds: i32,

    /// Per-attempt HTTP timeout in seconds.
    pub timeout_seconds: i32,

    /// Disabled webhooks are skipped even when events are pending.
    pub enabled: bool,

    /// When the webhook was created.
    pub created_at: DateTime<Utc>,

    /// When the webhook was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Creates an enabled webhook with a wildcard subscription.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookId::new(),
            name: name.into(),
            url: url.into(),
            secret: None,
            headers: Json(HashMap::new()),
            events: Json(vec![EventSubscription::all()]),
            max_retries: 3,
            retry_backoff_seconds: 60,
            timeout_seconds: i32::try_from(DEFAULT_TIMEOUT_SECONDS).unwrap_or(30),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Static headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Signing secret, treating an empty string as absent.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    /// Per-attempt timeout. Non-positive values fall back to the default.
    pub fn timeout(&self) -> Duration {
        u64::try_from(self.timeout_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map_or(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS), Duration::from_secs)
    }

    /// Returns true if any subscription matches the change.
    pub fn subscribes_to(&self, schema: &str, table: &str, operation: Operation) -> bool {
        self.events.0.iter().any(|s| s.matches(schema, table, operation))
    }
}

/// A row change announced by the change-capture layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Operation that changed the row.
    pub operation: Operation,
    /// Source schema.
    pub schema: String,
    /// Source table.
    pub table: String,
    /// Primary key of the changed row, if known.
    pub record_id: Option<String>,
    /// Row state before the change (UPDATE, DELETE).
    pub old_record: Option<Value>,
    /// Row state after the change (INSERT, UPDATE).
    pub new_record: Option<Value>,
}

/// One queued occurrence of a row change destined for one webhook.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookEvent {
    /// Unique identifier.
    pub id: EventId,

    /// Webhook this event is queued for.
    pub webhook_id: WebhookId,

    /// Operation that produced the event.
    pub operation: Operation,

    /// Source schema.
    pub table_schema: String,

    /// Source table.
    pub table_name: String,

    /// Primary key of the source row, if known.
    pub record_id: Option<String>,

    /// Previous row state (UPDATE, DELETE).
    pub old_data: Option<Json<Value>>,

    /// New row state (INSERT, UPDATE).
    pub new_data: Option<Json<Value>>,

    /// Set once the event has been delivered.
    pub processed: bool,

    /// Failed delivery attempts so far.
    pub attempts: i32,

    /// Time of the most recent attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the event becomes due again. `None` means never attempted or
    /// terminally failed; the two are told apart by `attempts`.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Error from the most recent failed attempt.
    pub error_message: Option<String>,

    /// When the event was queued.
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    /// Builds a fresh, never-attempted event for `webhook_id` from a change.
    pub fn from_change(webhook_id: WebhookId, change: &RowChange, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            webhook_id,
            operation: change.operation,
            table_schema: change.schema.clone(),
            table_name: change.table.clone(),
            record_id: change.record_id.clone(),
            old_data: change.old_record.clone().map(Json),
            new_data: change.new_record.clone().map(Json),
            processed: false,
            attempts: 0,
            last_attempt_at: None,
            next_retry_at: None,
            error_message: None,
            created_at: now,
        }
    }

    /// True once retries are exhausted: attempted, unprocessed, and no
    /// further retry scheduled.
    pub fn is_terminally_failed(&self) -> bool {
        !self.processed && self.attempts > 0 && self.next_retry_at.is_none()
    }

    /// True if a worker should attempt this event at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.processed {
            return false;
        }
        match self.next_retry_at {
            Some(at) => at <= now,
            None => self.attempts == 0,
        }
    }
}

/// Status of an audit delivery row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Send in progress.
    Pending,
    /// Receiver accepted the payload.
    Success,
    /// Send failed.
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match <&str as sqlx::Decode<PgDb>>::decode(value)? {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            s => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

/// Audit record of a single send attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookDelivery {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning webhook.
    pub webhook_id: WebhookId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Operation name of the event.
    pub operation: Operation,
    /// Outcome so far.
    pub status: DeliveryStatus,
    /// 1-based attempt number.
    pub attempt_number: i32,
    /// HTTP status returned by the receiver, if any.
    pub response_status: Option<i32>,
    /// Failure description, if any.
    pub error_message: Option<String>,
    /// When the attempt started.
    pub created_at: DateTime<Utc>,
    /// When the attempt finished.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// Creates a pending audit row for the next attempt of `event`.
    pub fn pending(event: &WebhookEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            webhook_id: event.webhook_id,
            event_id: event.id,
            operation: event.operation,
            status: DeliveryStatus::Pending,
            attempt_number: event.attempts.saturating_add(1),
            response_status: None,
            error_message: None,
            created_at: now,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn insert_change() -> RowChange {
        RowChange {
            operation: Operation::Insert,
            schema: "public".to_string(),
            table: "orders".to_string(),
            record_id: Some("42".to_string()),
            old_record: None,
            new_record: Some(json!({"id": 42})),
        }
    }

    #[test]
    fn operation_round_trips_through_strings() {
        for op in [Operation::Insert, Operation::Update, Operation::Delete] {
            assert_eq!(op.to_string().parse::<Operation>().unwrap(), op);
        }
        assert_eq!("delete".parse::<Operation>().unwrap(), Operation::Delete);
        assert!("TRUNCATE".parse::<Operation>().is_err());
    }

    #[test]
    fn subscription_matching() {
        let wildcard = EventSubscription::all();
        assert!(wildcard.matches("public", "orders", Operation::Delete));

        let qualified = EventSubscription {
            table: "public.orders".to_string(),
            operations: vec![Operation::Insert, Operation::Update],
        };
        assert!(qualified.matches("public", "orders", Operation::Insert));
        assert!(!qualified.matches("public", "orders", Operation::Delete));
        assert!(!qualified.matches("audit", "orders", Operation::Insert));

        let bare = EventSubscription { table: "orders".to_string(), operations: vec![] };
        assert!(bare.matches("sales", "orders", Operation::Update));
        assert!(!bare.matches("sales", "customers", Operation::Update));
    }

    #[test]
    fn webhook_timeout_falls_back_for_non_positive_values() {
        let mut webhook = Webhook::new("hook", "https://example.com");
        webhook.timeout_seconds = 0;
        assert_eq!(webhook.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECONDS));

        webhook.timeout_seconds = 5;
        assert_eq!(webhook.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn empty_secret_disables_signing() {
        let mut webhook = Webhook::new("hook", "https://example.com");
        webhook.secret = Some(String::new());
        assert!(webhook.signing_secret().is_none());

        webhook.secret = Some("s3cret".to_string());
        assert_eq!(webhook.signing_secret(), Some("s3cret"));
    }

    #[test]
    fn fresh_event_is_due_and_not_terminal() {
        let now = Utc::now();
        let event = WebhookEvent::from_change(WebhookId::new(), &insert_change(), now);

        assert_eq!(event.attempts, 0);
        assert!(event.old_data.is_none());
        assert!(event.is_due(now));
        assert!(!event.is_terminally_failed());
    }

    #[test]
    fn terminal_event_is_never_due() {
        let now = Utc::now();
        let mut event = WebhookEvent::from_change(WebhookId::new(), &insert_change(), now);
        event.attempts = 3;
        event.error_message = Some("server error: HTTP 500".to_string());

        assert!(event.is_terminally_failed());
        assert!(!event.is_due(now + chrono::Duration::days(1)));
    }

    #[test]
    fn scheduled_retry_becomes_due_at_next_retry_at() {
        let now = Utc::now();
        let mut event = WebhookEvent::from_change(WebhookId::new(), &insert_change(), now);
        event.attempts = 1;
        event.next_retry_at = Some(now + chrono::Duration::seconds(60));

        assert!(!event.is_due(now));
        assert!(event.is_due(now + chrono::Duration::seconds(60)));
    }
}
