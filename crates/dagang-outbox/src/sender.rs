//! HTTP delivery of signed webhook payloads.
//!
//! Each attempt is a single POST of the item's raw payload, signed with
//! HMAC-SHA256 so receivers can verify origin and integrity. The sender
//! performs exactly one attempt per call; retry scheduling belongs to the
//! dispatcher and backoff policy.

use std::{future::Future, pin::Pin, time::Duration};

use dagang_core::models::QueueItem;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{OutboxError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Signature header carried on every delivery.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// API key header carried on every delivery.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// HMAC signing secret shared with receivers.
    pub secret: String,
    /// API key sent with every request.
    pub api_key: String,
    /// Hard per-attempt timeout covering connect through body read.
    pub timeout: Duration,
    /// Service name used in the User-Agent header.
    pub service_name: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            service_name: "dagang".to_string(),
        }
    }
}

/// One delivery attempt against an item's target endpoint.
///
/// Implementations report success only for 2xx responses; everything else
/// surfaces as a typed [`OutboxError`] for the classifier.
pub trait WebhookSender: Send + Sync + 'static {
    /// Performs a single delivery attempt.
    fn attempt<'a>(
        &'a self,
        item: &'a QueueItem,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Production sender over a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
    config: SenderConfig,
}

impl HttpSender {
    /// Creates a sender, validating configuration up front.
    ///
    /// An empty secret or API key would silently produce deliveries every
    /// receiver rejects, so construction fails instead.
    pub fn new(config: SenderConfig) -> Result<Self> {
        if config.secret.is_empty() {
            return Err(OutboxError::configuration("webhook signing secret is empty"));
        }
        if config.api_key.is_empty() {
            return Err(OutboxError::configuration("webhook api key is empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("{}/1.0", config.service_name))
            .build()
            .map_err(|e| OutboxError::configuration(format!("failed to build http client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Hex HMAC-SHA256 of the payload, in `sha256=<hex>` form.
    fn sign(&self, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(self.config.secret.as_bytes())
            .expect("hmac accepts keys of any length");
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn send(&self, item: &QueueItem) -> Result<()> {
        let signature = self.sign(&item.payload);

        let response = self
            .client
            .post(&item.target_url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(API_KEY_HEADER, &self.config.api_key)
            .body(item.payload.clone())
            .send()
            .await
            .map_err(|e| self.map_transport_error(&e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                delivery_id = %item.id,
                correlation_id = %item.correlation_id,
                status = status.as_u16(),
                "webhook delivered"
            );
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let truncated: String = body.chars().take(500).collect();
        Err(OutboxError::http_status(status.as_u16(), truncated))
    }

    fn map_transport_error(&self, error: &reqwest::Error) -> OutboxError {
        if error.is_timeout() {
            OutboxError::timeout(self.config.timeout)
        } else if error.is_connect() {
            OutboxError::network(format!("connection failed: {error}"))
        } else {
            OutboxError::network(error.to_string())
        }
    }
}

impl WebhookSender for HttpSender {
    fn attempt<'a>(
        &'a self,
        item: &'a QueueItem,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.send(item))
    }
}

pub mod mock {
    //! Scripted sender double for dispatcher tests.

    use std::{collections::VecDeque, future::Future, pin::Pin, sync::Arc};

    use dagang_core::models::{DeliveryId, QueueItem};
    use tokio::sync::Mutex;

    use super::WebhookSender;
    use crate::error::{OutboxError, Result};

    /// Sender that replays a scripted sequence of outcomes.
    ///
    /// Outcomes are consumed in claim order; once the script runs dry every
    /// further attempt succeeds. Attempted ids are recorded for assertions.
    pub struct FakeSender {
        script: Arc<Mutex<VecDeque<Result<()>>>>,
        attempts: Arc<Mutex<Vec<DeliveryId>>>,
    }

    impl FakeSender {
        /// Creates a sender with an empty script (every attempt succeeds).
        pub fn new() -> Self {
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                attempts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Appends a success outcome to the script.
        pub async fn push_success(&self) {
            self.script.lock().await.push_back(Ok(()));
        }

        /// Appends a failure outcome to the script.
        pub async fn push_failure(&self, error: OutboxError) {
            self.script.lock().await.push_back(Err(error));
        }

        /// Ids attempted so far, in order.
        pub async fn attempted(&self) -> Vec<DeliveryId> {
            self.attempts.lock().await.clone()
        }

        /// Number of attempts made so far.
        pub async fn attempt_count(&self) -> usize {
            self.attempts.lock().await.len()
        }
    }

    impl Default for FakeSender {
        fn default() -> Self {
            Self::new()
        }
    }

    impl WebhookSender for FakeSender {
        fn attempt<'a>(
            &'a self,
            item: &'a QueueItem,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            let script = self.script.clone();
            let attempts = self.attempts.clone();
            let id = item.id;

            Box::pin(async move {
                attempts.lock().await.push(id);
                script.lock().await.pop_front().unwrap_or(Ok(()))
            })
        }
    }
}
