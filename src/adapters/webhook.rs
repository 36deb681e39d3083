//! Webhook delivery over HTTP
//!
//! Posts order event payloads to subscriber endpoints. Retry and
//! backoff policy live in the dispatcher; this adapter performs one
//! attempt and reports the outcome.

use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use tracing::{debug, error};

use crate::domain::{Order, OrderEventKind, TransitionRecord};
use crate::error::{Result, TrellisError};

/// Payload posted to subscribers: the event kind plus the canonical
/// order snapshot as of the transition.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: OrderEventKind,
    pub order: &'a Order,
    pub recorded_at: chrono::DateTime<chrono::Utc>,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_record(record: &'a TransitionRecord) -> Self {
        Self {
            event: record.event,
            order: &record.order,
            recorded_at: record.recorded_at,
        }
    }
}

/// HTTP webhook sender
#[derive(Clone)]
pub struct WebhookSender {
    client: Client,
}

impl WebhookSender {
    pub fn new(request_timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(request_timeout_secs))
            .build()?;
        Ok(Self { client })
    }

    /// Deliver one payload. Non-2xx responses and transport errors both
    /// come back as Delivery errors for the dispatcher to retry.
    pub async fn deliver(&self, url: &str, payload: &WebhookPayload<'_>) -> Result<()> {
        match self.client.post(url).json(payload).send().await {
            Ok(resp) => {
                if resp.status().is_success() {
                    debug!("webhook delivered to {} ({})", url, payload.event);
                    Ok(())
                } else {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    error!("webhook to {} failed: {} - {}", url, status, body);
                    Err(TrellisError::delivery(format!("HTTP {}: {}", status, body)))
                }
            }
            Err(e) => {
                error!("webhook request to {} failed: {}", url, e);
                Err(TrellisError::delivery(e.to_string()))
            }
        }
    }
}

/// Basic syntax check applied when a subscription is registered.
pub fn validate_webhook_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(TrellisError::validation(format!(
            "webhook url must be http(s), got '{}'",
            url
        )));
    }
    // reqwest does the full parse; catch obviously empty hosts early
    let rest = url.split("://").nth(1).unwrap_or_default();
    if rest.is_empty() || rest.starts_with('/') {
        return Err(TrellisError::validation(format!(
            "webhook url '{}' has no host",
            url
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_validation() {
        assert!(validate_webhook_url("http://localhost:8080/hook").is_ok());
        assert!(validate_webhook_url("https://example.com/orders").is_ok());

        assert!(validate_webhook_url("ftp://example.com").is_err());
        assert!(validate_webhook_url("example.com/hook").is_err());
        assert!(validate_webhook_url("http://").is_err());
        assert!(validate_webhook_url("https:///hook").is_err());
    }

    #[tokio::test]
    async fn test_sender_builds_with_configured_timeout() {
        assert!(WebhookSender::new(5).is_ok());
    }

    #[test]
    fn test_payload_shape() {
        use crate::domain::{Order, OrderSide, OrderSpec, OrderStatus};
        use rust_decimal_macros::dec;

        let mut order = Order::from_spec(&OrderSpec::market(
            "entry",
            "AAPL",
            OrderSide::Buy,
            dec!(10),
        ));
        order.status = OrderStatus::Filled;

        let payload = WebhookPayload {
            event: OrderEventKind::Filled,
            order: &order,
            recorded_at: chrono::Utc::now(),
        };
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["event"], "filled");
        assert_eq!(json["order"]["symbol"], "AAPL");
        assert_eq!(json["order"]["status"], "FILLED");
        assert!(json["recorded_at"].is_string());
    }
}
