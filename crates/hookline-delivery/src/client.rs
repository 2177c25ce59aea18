//! HTTP client for webhook delivery.
//!
//! One call to [`DeliveryClient::deliver`] is exactly one POST: validate the
//! destination, serialize and sign the payload, attach headers, send with the
//! webhook's timeout, and classify the response. Retrying is the caller's
//! business.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use hookline_core::{Clock, Webhook};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    payload::WebhookPayload,
    signing::{self, LEGACY_SIGNATURE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER},
    url_guard::UrlGuard,
};

/// Default `User-Agent` sent with every delivery.
pub const DEFAULT_USER_AGENT: &str = "Hookline-Webhooks/1.0";

const MAX_RESPONSE_BODY: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// User agent string for requests.
    pub user_agent: String,
    /// Connect timeout applied below the per-webhook request timeout.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self { user_agent: DEFAULT_USER_AGENT.to_string(), connect_timeout: Duration::from_secs(10) }
    }
}

/// Successful response from a receiver.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code (below 400).
    pub status_code: u16,
    /// Response body, truncated.
    pub body: String,
    /// Total duration of the request.
    pub duration: Duration,
}

/// HTTP client that signs and posts webhook payloads.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    guard: UrlGuard,
    clock: Arc<dyn Clock>,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a client whose DNS lookups are filtered by `guard`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig, guard: UrlGuard, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .dns_resolver(Arc::new(guard.resolver()))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, guard, clock, config })
    }

    /// Guard shared with the resolver.
    pub fn guard(&self) -> &UrlGuard {
        &self.guard
    }

    /// Sends `payload` to `webhook` once.
    ///
    /// # Errors
    ///
    /// - `InvalidUrl` / `UnsafeDestination` if the destination is refused
    /// - `Serialization` if the payload cannot be encoded
    /// - `NetworkError` / `Timeout` for transport failures
    /// - `ClientError` / `ServerError` for status 400 and above
    /// - `Cancelled` if `cancel` fires first
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        webhook: &Webhook,
        payload: &WebhookPayload,
    ) -> Result<DeliveryResponse> {
        let span = info_span!(
            "http_post",
            webhook_id = %webhook.id,
            url = %webhook.url,
            event = %payload.event,
        );

        async move {
            let url = self.guard.validate(&webhook.url).await?;
            let body = Bytes::from(serde_json::to_vec(payload)?);
            let timeout = webhook.timeout();

            let mut request = self
                .client
                .post(url)
                .timeout(timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(reqwest::header::USER_AGENT, &self.config.user_agent);

            for (name, value) in webhook.headers() {
                if is_managed_header(name) {
                    debug!(header = %name, "skipping managed header");
                    continue;
                }
                request = request.header(name.as_str(), value.as_str());
            }

            if let Some(secret) = webhook.signing_secret() {
                let signature = signing::sign(&body, secret, self.clock.now_utc().timestamp());
                request = request
                    .header(SIGNATURE_HEADER, signature.current)
                    .header(LEGACY_SIGNATURE_HEADER, signature.legacy)
                    .header(TIMESTAMP_HEADER, signature.timestamp.to_string());
            }

            let start = std::time::Instant::now();
            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DeliveryError::Cancelled),
                result = request.body(body).send() => result,
            };

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    warn!(duration_ms = start.elapsed().as_millis(), error = %e, "request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout_after(timeout));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let body = read_body(response).await;
            let duration = start.elapsed();

            if status_code >= 400 {
                warn!(status = status_code, duration_ms = duration.as_millis(), "receiver rejected delivery");
                return Err(DeliveryError::from_status(status_code, body));
            }

            debug!(status = status_code, duration_ms = duration.as_millis(), "delivered");
            Ok(DeliveryResponse { status_code, body, duration })
        }
        .instrument(span)
        .await
    }
}

async fn read_body(response: Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let end = bytes.len().min(MAX_RESPONSE_BODY);
            String::from_utf8_lossy(&bytes[..end]).into_owned()
        },
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

/// Headers the engine sets itself; static webhook headers never override them.
fn is_managed_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == "content-type"
        || lower == "content-length"
        || lower == "host"
        || lower == "user-agent"
        || lower == "transfer-encoding"
        || lower == SIGNATURE_HEADER.to_ascii_lowercase()
        || lower == LEGACY_SIGNATURE_HEADER.to_ascii_lowercase()
        || lower == TIMESTAMP_HEADER.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_headers_detected_case_insensitively() {
        assert!(is_managed_header("Content-Type"));
        assert!(is_managed_header("x-webhook-signature"));
        assert!(is_managed_header("X-HUB-SIGNATURE-256"));
        assert!(is_managed_header("x-webhook-timestamp"));
        assert!(!is_managed_header("Authorization"));
        assert!(!is_managed_header("X-Request-Source"));
    }

    #[test]
    fn default_config_uses_product_user_agent() {
        assert_eq!(ClientConfig::default().user_agent, DEFAULT_USER_AGENT);
    }
}
