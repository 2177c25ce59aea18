//! Wire payload posted to webhook receivers.

use chrono::{DateTime, Utc};
use hookline_core::{Operation, WebhookEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON body of a webhook delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Operation name: `INSERT`, `UPDATE` or `DELETE`.
    pub event: Operation,
    /// Source table.
    pub table: String,
    /// Source schema.
    pub schema: String,
    /// Row after the change. `null` for `DELETE`.
    pub record: Value,
    /// Row before an `UPDATE` or `DELETE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Value>,
    /// When this payload was built.
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    /// Builds the payload for one delivery attempt of `event`.
    pub fn from_event(event: &WebhookEvent, now: DateTime<Utc>) -> Self {
        let new = event.new_data.as_ref().map(|j| j.0.clone());
        let old = event.old_data.as_ref().map(|j| j.0.clone());

        let old_record = match event.operation {
            Operation::Insert => None,
            Operation::Update | Operation::Delete => old,
        };

        Self {
            event: event.operation,
            table: event.table_name.clone(),
            schema: event.table_schema.clone(),
            record: new.unwrap_or(Value::Null),
            old_record,
            timestamp: now,
        }
    }
}
