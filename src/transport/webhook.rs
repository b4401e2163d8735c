//! Publish-only transport that POSTs each message as JSON to a relay URL.

use super::{GuardianMessage, Transport, TransportError};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Serialize)]
struct Envelope<'a> {
    topic: &'a str,
    message: &'a GuardianMessage,
}

pub struct WebhookTransport {
    url: String,
    http: Client,
}

impl WebhookTransport {
    pub fn new(url: String, timeout: Duration) -> Result<Self, TransportError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn publish(&self, topic: &str, message: &GuardianMessage) -> Result<(), TransportError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&Envelope { topic, message })
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(topic, %message, "message posted to webhook");
        Ok(())
    }

    async fn subscribe(
        &self,
        _topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<GuardianMessage>, TransportError> {
        Err(TransportError::Unsupported("subscribe"))
    }
}
