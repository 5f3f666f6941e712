//! Network delivery of serialized batches.

use crate::{OutboxError, OutboxResult};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Delivers one serialized batch. A single attempt: retries are the
/// backlog sweeper's job.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send(&self, payload: &[u8], content_type: &str) -> OutboxResult<()>;
}

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Absolute URI batches are POSTed to.
    pub endpoint: Url,
    /// Request timeout.
    pub timeout: Duration,
}

/// HTTP POST sender. Any 2xx status is success.
#[derive(Debug, Clone)]
pub struct HttpBatchSender {
    client: Client,
    endpoint: Url,
}

impl HttpBatchSender {
    pub fn new(config: SenderConfig) -> OutboxResult<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl BatchSender for HttpBatchSender {
    async fn send(&self, payload: &[u8], content_type: &str) -> OutboxResult<()> {
        debug!(
            url = %self.endpoint,
            bytes = payload.len(),
            "Sending batch"
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, content_type)
            .body(payload.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OutboxError::Delivery {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str) -> SenderConfig {
        SenderConfig {
            endpoint: Url::parse(endpoint).unwrap(),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn sender_keeps_endpoint() {
        let sender = HttpBatchSender::new(config("https://ingest.example.test/v2/track")).unwrap();
        assert_eq!(
            sender.endpoint().as_str(),
            "https://ingest.example.test/v2/track"
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_an_error() {
        // Port 1 on loopback refuses connections.
        let sender = HttpBatchSender::new(config("http://127.0.0.1:1/track")).unwrap();
        let result = sender.send(b"{}\n", "application/x-json-stream").await;
        assert!(matches!(result, Err(OutboxError::Http(_))));
    }
}
