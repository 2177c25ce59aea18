//! Property-based tests for subscription matching and event scheduling.

#![allow(clippy::unwrap_used)]

use chrono::{Duration, TimeZone, Utc};
use hookline_core::{EventSubscription, Operation, RowChange, WebhookEvent, WebhookId};
use proptest::prelude::*;

fn operation() -> impl Strategy<Value = Operation> {
    prop_oneof![Just(Operation::Insert), Just(Operation::Update), Just(Operation::Delete)]
}

fn change(operation: Operation) -> RowChange {
    RowChange {
        operation,
        schema: "public".to_string(),
        table: "orders".to_string(),
        record_id: None,
        old_record: None,
        new_record: None,
    }
}

proptest! {
    #[test]
    fn wildcard_matches_every_table(
        schema in "[a-z_]{1,12}",
        table in "[a-z_]{1,12}",
        op in operation(),
    ) {
        prop_assert!(EventSubscription::all().matches(&schema, &table, op));
    }

    #[test]
    fn qualified_name_requires_matching_schema(
        schema in "[a-z]{1,8}",
        other in "[a-z]{1,8}",
        table in "[a-z]{1,8}",
        op in operation(),
    ) {
        let subscription = EventSubscription {
            table: format!("{schema}.{table}"),
            operations: vec![],
        };
        prop_assert!(subscription.matches(&schema, &table, op));
        prop_assert_eq!(subscription.matches(&other, &table, op), schema == other);
    }

    #[test]
    fn operation_filter_is_respected(op in operation(), listed in operation()) {
        let subscription = EventSubscription { table: "orders".to_string(), operations: vec![listed] };
        prop_assert_eq!(subscription.matches("public", "orders", op), op == listed);
    }

    #[test]
    fn retry_events_become_due_exactly_at_next_retry(
        attempts in 1i32..10,
        delay_secs in 1i64..10_000,
        offset in -10_000i64..10_000,
    ) {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut event = WebhookEvent::from_change(WebhookId::new(), &change(Operation::Insert), created);
        let next = created + Duration::seconds(delay_secs);
        event.attempts = attempts;
        event.next_retry_at = Some(next);

        let now = next + Duration::seconds(offset);
        prop_assert_eq!(event.is_due(now), offset >= 0);

        event.processed = true;
        prop_assert!(!event.is_due(now));
    }

    #[test]
    fn terminal_events_are_never_due(attempts in 1i32..10, offset in 0i64..1_000_000) {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut event = WebhookEvent::from_change(WebhookId::new(), &change(Operation::Update), created);
        event.attempts = attempts;
        event.next_retry_at = None;

        prop_assert!(event.is_terminally_failed());
        prop_assert!(!event.is_due(created + Duration::seconds(offset)));
    }
}
