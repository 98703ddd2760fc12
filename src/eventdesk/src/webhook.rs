//! Outbound webhook delivery over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use eventdesk_core::config::WebhookClientConfig;
use eventdesk_journey::collaborators::{WebhookRequest, WebhookResponse};
use eventdesk_journey::{EffectError, WebhookCaller};

/// Response bodies longer than this are cut before they reach the log.
const MAX_BODY_CHARS: usize = 4096;

pub struct HttpWebhookCaller {
    client: reqwest::Client,
}

impl HttpWebhookCaller {
    pub fn new(config: &WebhookClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    /// POSTs the payload as JSON. Any HTTP status is returned as a response;
    /// only transport problems are errors.
    async fn call(&self, request: WebhookRequest) -> Result<WebhookResponse, EffectError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(&request.payload);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                EffectError::permanent(format!("invalid webhook request: {e}"))
            } else {
                EffectError::transient(format!("webhook transport error: {e}"))
            }
        })?;

        let status_code = response.status().as_u16();
        let body = match response.text().await {
            Ok(text) => text.chars().take(MAX_BODY_CHARS).collect(),
            Err(e) => format!("<unreadable body: {e}>"),
        };
        debug!(url = %request.url, status_code, "Webhook delivered");
        Ok(WebhookResponse { status_code, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_malformed_url_is_permanent() {
        let caller = HttpWebhookCaller::new(&WebhookClientConfig::default()).unwrap();
        let err = caller
            .call(WebhookRequest {
                url: "not a url".into(),
                payload: serde_json::json!({}),
                headers: BTreeMap::new(),
                idempotency_key: "k-1".into(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }
}
