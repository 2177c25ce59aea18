//! Integration tests for the HTTP delivery client against a live receiver.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use hookline_core::{Operation, RowChange, TestClock, Webhook, WebhookEvent};
use hookline_delivery::{
    client::{ClientConfig, DeliveryClient, DEFAULT_USER_AGENT},
    signing, DeliveryError, UrlGuard, WebhookPayload,
};
use serde_json::{json, Value};
use sqlx::types::Json;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn client(allow_private: bool) -> DeliveryClient {
    let clock = Arc::new(TestClock::starting_at(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
    DeliveryClient::new(ClientConfig::default(), UrlGuard::new(allow_private), clock)
        .expect("client should build")
}

fn webhook(url: String) -> Webhook {
    let mut webhook = Webhook::new("orders", url);
    webhook.timeout_seconds = 5;
    webhook
}

fn payload() -> WebhookPayload {
    let change = RowChange {
        operation: Operation::Insert,
        schema: "public".to_string(),
        table: "orders".to_string(),
        record_id: Some("7".to_string()),
        old_record: None,
        new_record: Some(json!({"id": 7, "total": 12.5})),
    };
    let event = WebhookEvent::from_change(hookline_core::WebhookId::new(), &change, Utc::now());
    WebhookPayload::from_event(&event, Utc::now())
}

#[tokio::test]
async fn delivers_json_with_fixed_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("content-type", "application/json"))
        .and(header("user-agent", DEFAULT_USER_AGENT))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;

    let response = client(true)
        .deliver(&CancellationToken::new(), &webhook(format!("{}/hook", server.uri())), &payload())
        .await
        .expect("delivery should succeed");

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body, "ok");

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "INSERT");
    assert_eq!(body["table"], "orders");
    assert_eq!(body["schema"], "public");
    assert_eq!(body["record"]["id"], 7);
    assert!(body.get("old_record").is_none());
}

#[tokio::test]
async fn delete_body_carries_old_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let change = RowChange {
        operation: Operation::Delete,
        schema: "public".to_string(),
        table: "users".to_string(),
        record_id: Some("9".to_string()),
        old_record: Some(json!({"id": 9})),
        new_record: None,
    };
    let event = WebhookEvent::from_change(hookline_core::WebhookId::new(), &change, Utc::now());
    let payload = WebhookPayload::from_event(&event, Utc::now());

    client(true)
        .deliver(&CancellationToken::new(), &webhook(server.uri()), &payload)
        .await
        .expect("delivery should succeed");

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["event"], "DELETE");
    assert_eq!(body["old_record"], json!({"id": 9}));
    assert!(body["record"].is_null());
}

#[tokio::test]
async fn no_secret_means_no_signature_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(204)).mount(&server).await;

    client(true)
        .deliver(&CancellationToken::new(), &webhook(server.uri()), &payload())
        .await
        .expect("delivery should succeed");

    let requests = server.received_requests().await.unwrap();
    let headers = &requests[0].headers;
    assert!(headers.get(signing::SIGNATURE_HEADER).is_none());
    assert!(headers.get(signing::LEGACY_SIGNATURE_HEADER).is_none());
    assert!(headers.get(signing::TIMESTAMP_HEADER).is_none());
}

#[tokio::test]
async fn receiver_can_verify_signature_byte_for_byte() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let mut hook = webhook(server.uri());
    hook.secret = Some("whsec_test".to_string());

    client(true).deliver(&CancellationToken::new(), &hook, &payload()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let current = request.headers.get(signing::SIGNATURE_HEADER).unwrap().to_str().unwrap();
    let legacy = request.headers.get(signing::LEGACY_SIGNATURE_HEADER).unwrap().to_str().unwrap();
    let timestamp = request.headers.get(signing::TIMESTAMP_HEADER).unwrap().to_str().unwrap();

    let recomputed = signing::sign(&request.body, "whsec_test", timestamp.parse().unwrap());
    assert_eq!(current, recomputed.current);
    assert_eq!(legacy, recomputed.legacy);
    assert!(signing::verify(&request.body, "whsec_test", current));
    assert_eq!(timestamp, "1709251200");
}

#[tokio::test]
async fn static_headers_never_override_managed_ones() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let mut hook = webhook(server.uri());
    hook.secret = Some("s".to_string());
    hook.headers = Json(HashMap::from([
        ("Authorization".to_string(), "Bearer abc".to_string()),
        ("Content-Type".to_string(), "text/plain".to_string()),
        ("X-Webhook-Signature".to_string(), "forged".to_string()),
    ]));

    client(true).deliver(&CancellationToken::new(), &hook, &payload()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let headers = &requests[0].headers;
    assert_eq!(headers.get("authorization").unwrap(), "Bearer abc");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
    assert_ne!(headers.get(signing::SIGNATURE_HEADER).unwrap(), "forged");
    assert_eq!(headers.get_all(signing::SIGNATURE_HEADER).iter().count(), 1);
}

#[tokio::test]
async fn error_statuses_carry_status_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/server"))
        .respond_with(ResponseTemplate::new(503).set_body_string("down"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/client"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let client = client(true);
    let cancel = CancellationToken::new();

    let err = client
        .deliver(&cancel, &webhook(format!("{}/server", server.uri())), &payload())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::ServerError { status_code: 503, .. }));
    assert!(err.to_string().contains("503"));

    let err = client
        .deliver(&cancel, &webhook(format!("{}/client", server.uri())), &payload())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::ClientError { status_code: 410, .. }));
}

#[tokio::test]
async fn loopback_destination_rejected_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    // MockServer listens on 127.0.0.1.
    let err = client(false)
        .deliver(&CancellationToken::new(), &webhook(server.uri()), &payload())
        .await
        .unwrap_err();

    assert!(matches!(err, DeliveryError::UnsafeDestination { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn override_can_be_flipped_at_runtime() {
    let server = MockServer::start().await;
    Mock::given(method("POST")).respond_with(ResponseTemplate::new(200)).mount(&server).await;

    let client = client(false);
    let hook = webhook(server.uri());
    let cancel = CancellationToken::new();

    assert!(client.deliver(&cancel, &hook, &payload()).await.is_err());
    client.guard().set_allow_private(true);
    assert!(client.deliver(&cancel, &hook, &payload()).await.is_ok());
}

#[tokio::test]
async fn non_http_scheme_is_invalid() {
    let err = client(true)
        .deliver(&CancellationToken::new(), &webhook("ftp://example.com/x".to_string()), &payload())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::InvalidUrl { .. }));
}

#[tokio::test]
async fn slow_receiver_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let mut hook = webhook(server.uri());
    hook.timeout_seconds = 1;

    let err = client(true).deliver(&CancellationToken::new(), &hook, &payload()).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Timeout { timeout_seconds: 1 }));
}

#[tokio::test]
async fn cancellation_interrupts_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = client(true).deliver(&cancel, &webhook(server.uri()), &payload()).await.unwrap_err();

    assert!(matches!(err, DeliveryError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(4));
}
