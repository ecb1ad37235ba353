use anyhow::Result;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ApprovalEvent, NotificationSink};

// ── HMAC Signing ─────────────────────────────────────────────

/// Compute HMAC-SHA256 of `payload` using `secret`.
/// Returns the lowercase hex digest prefixed with "sha256=".
pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

// ── Webhook Notifier ──────────────────────────────────────────

/// Posts approval events to the configured URLs.
/// - HMAC-SHA256 signing (`x-sqlgate-signature`) when a secret is set
/// - Up to 3 retries with back-off between attempts
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
    secret: Option<String>,
    backoff: Vec<Duration>,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("sqlgate-webhook/1.0")
            .build()?;
        Ok(Self {
            client,
            urls,
            secret,
            backoff: [0, 1, 5, 25].into_iter().map(Duration::from_secs).collect(),
        })
    }

    /// Replace the retry schedule. The first entry is the delay before the
    /// first attempt.
    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    /// Send one event to a single URL, retrying on failure.
    pub async fn send_signed(&self, url: &str, event: &ApprovalEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| anyhow::anyhow!("webhook serialize error: {}", e))?;
        let delivery_id = uuid::Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().timestamp().to_string();
        let signature = match self.secret.as_deref() {
            Some(secret) => Some(hmac_sha256_hex(secret, &payload)?),
            None => None,
        };

        for (attempt, delay) in self.backoff.iter().enumerate() {
            if !delay.is_zero() {
                debug!(
                    url,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    event_type = %event.event_type,
                    "retrying webhook delivery"
                );
                tokio::time::sleep(*delay).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("content-type", "application/json")
                .header("x-sqlgate-delivery-id", &delivery_id)
                .header("x-sqlgate-timestamp", &timestamp)
                .header("x-sqlgate-event", &event.event_type);

            if let Some(ref sig) = signature {
                req = req.header("x-sqlgate-signature", sig.as_str());
            }

            match req.body(payload.clone()).send().await {
                Ok(resp) if resp.status().is_success() => {
                    info!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        "webhook delivered"
                    );
                    return Ok(());
                }
                Ok(resp) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        status = %resp.status(),
                        "webhook delivery failed (non-2xx)"
                    );
                }
                Err(e) => {
                    warn!(
                        url,
                        event_type = %event.event_type,
                        delivery_id = %delivery_id,
                        attempt,
                        error = %e,
                        "webhook request error"
                    );
                }
            }
        }

        Err(anyhow::anyhow!(
            "webhook delivery failed after {} attempts: {}",
            self.backoff.len(),
            url
        ))
    }
}

impl NotificationSink for WebhookNotifier {
    /// Fire-and-forget: each URL is attempted independently on a spawned task.
    fn notify(&self, event: ApprovalEvent) {
        if self.urls.is_empty() {
            debug!(event_type = %event.event_type, "no webhook targets, skipping");
            return;
        }

        let notifier = self.clone();
        tokio::spawn(async move {
            for url in &notifier.urls {
                if let Err(e) = notifier.send_signed(url, &event).await {
                    warn!(url, error = %e, "webhook dispatch ultimately failed");
                }
            }
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> ApprovalEvent {
        ApprovalEvent {
            event_type: "approval_requested".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            approval_id: uuid::Uuid::nil().to_string(),
            data_source_id: uuid::Uuid::nil().to_string(),
            actor: "alice".to_string(),
            details: serde_json::json!({ "operation": "delete" }),
        }
    }

    #[test]
    fn test_hmac_signature_deterministic() {
        let sig1 = hmac_sha256_hex("secret123", b"payload").unwrap();
        let sig2 = hmac_sha256_hex("secret123", b"payload").unwrap();
        assert_eq!(sig1, sig2);
        assert!(sig1.starts_with("sha256="));
    }

    #[test]
    fn test_hmac_signature_different_secret() {
        let sig1 = hmac_sha256_hex("secret1", b"payload").unwrap();
        let sig2 = hmac_sha256_hex("secret2", b"payload").unwrap();
        assert_ne!(sig1, sig2);
    }

    #[tokio::test]
    async fn test_signed_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("x-sqlgate-event", "approval_requested"))
            .and(header_exists("x-sqlgate-signature"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/hook", server.uri());
        let notifier = WebhookNotifier::new(vec![url.clone()], Some("s3cret".into())).unwrap();
        notifier.send_signed(&url, &event()).await.unwrap();
    }

    #[tokio::test]
    async fn test_retries_then_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let url = format!("{}/hook", server.uri());
        let notifier = WebhookNotifier::new(vec![url.clone()], None)
            .unwrap()
            .with_backoff(vec![Duration::ZERO, Duration::from_millis(5), Duration::from_millis(5)]);
        assert!(notifier.send_signed(&url, &event()).await.is_err());
    }
}
