use super::{OutboundEnvelope, Transport};
use crate::model::Credential;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Transport backed by a sidecar bridge process that speaks the WhatsApp
/// protocol. Commands go out as JSON over HTTP; the bridge reports events
/// back through the signed `/api/transport/events` webhook.
pub struct BridgeTransport {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl BridgeTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("bridge request to {} failed", path))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(anyhow::anyhow!("bridge API error ({}): {}", status, body));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn connect(&self, credential: Option<&Credential>) -> Result<()> {
        info!(
            "requesting bridge connection (resume={})",
            credential.is_some()
        );
        self.post(
            "/session/connect",
            json!({ "credential": credential.map(|c| c.0.as_str()) }),
        )
        .await
    }

    async fn disconnect(&self) -> Result<()> {
        self.post("/session/logout", json!({})).await
    }

    async fn send(&self, envelope: &OutboundEnvelope) -> Result<()> {
        debug!(
            "bridge send: message={} contact={}",
            envelope.message_id, envelope.contact_id
        );
        self.post("/messages", serde_json::to_value(envelope)?).await
    }
}
