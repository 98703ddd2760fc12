use serde::Deserialize;

use crate::error::{CoreError, CoreResult};

/// Root application configuration. Loaded from environment variables
/// with the prefix `EVENTDESK__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub webhook: WebhookClientConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// ─── Automation Engine Config ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub scheduler_enabled: bool,
    /// Seconds between two scheduler ticks.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Lifetime of a worker's claim on an enrollment.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,
    /// Maximum enrollments selected per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    /// Guard on how many steps one enrollment may run inside a single tick.
    #[serde(default = "default_max_steps_per_tick")]
    pub max_steps_per_tick: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Local retry of a single step effect (email send, webhook call, contact
/// mutation) before the attempt is recorded as failed.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookClientConfig {
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_enabled() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9091
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    30
}
fn default_claim_ttl_secs() -> u64 {
    120
}
fn default_batch_size() -> usize {
    500
}
fn default_worker_pool_size() -> usize {
    16
}
fn default_max_steps_per_tick() -> u32 {
    25
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_webhook_timeout_ms() -> u64 {
    10_000
}
fn default_user_agent() -> String {
    "eventdesk-automations/0.1".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            port: default_metrics_port(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            claim_ttl_secs: default_claim_ttl_secs(),
            batch_size: default_batch_size(),
            worker_pool_size: default_worker_pool_size(),
            max_steps_per_tick: default_max_steps_per_tick(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for WebhookClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_webhook_timeout_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            automation: AutomationConfig::default(),
            webhook: WebhookClientConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(config_file: Option<&str>) -> CoreResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("EVENTDESK")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings under which a worker's claim could lapse while a
    /// single step is still calling out.
    pub fn validate(&self) -> CoreResult<()> {
        let claim_ttl_ms = self.automation.claim_ttl_secs.saturating_mul(1000);
        let worst_step_ms = self.worst_case_step_ms();
        if claim_ttl_ms <= worst_step_ms {
            return Err(CoreError::Invalid(format!(
                "automation.claim_ttl_secs ({}s) must exceed the longest single step \
                 ({worst_step_ms}ms: {} attempts at {}ms webhook timeout plus backoff)",
                self.automation.claim_ttl_secs,
                self.automation.retry.max_attempts,
                self.webhook.timeout_ms,
            )));
        }
        Ok(())
    }

    /// Upper bound on one effect step: every attempt runs into the webhook
    /// timeout, with the capped backoff slept between attempts.
    pub fn worst_case_step_ms(&self) -> u64 {
        let retry = &self.automation.retry;
        let attempts = retry.max_attempts.max(1);
        let calls = self.webhook.timeout_ms.saturating_mul(u64::from(attempts));
        let backoff: u64 = (0..attempts - 1)
            .map(|attempt| {
                let base = retry.initial_backoff_ms as f64
                    * retry.backoff_multiplier.powi(attempt as i32);
                base.min(retry.max_backoff_ms as f64) as u64
            })
            .fold(0, u64::saturating_add);
        calls.saturating_add(backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.automation.tick_interval_secs, 30);
        assert_eq!(config.automation.claim_ttl_secs, 120);
        assert_eq!(config.automation.retry.max_attempts, 3);
        assert!(config.automation.scheduler_enabled);
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"node_id": "worker-7", "automation": {"tick_interval_secs": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "worker-7");
        assert_eq!(config.automation.tick_interval_secs, 5);
        assert_eq!(config.automation.worker_pool_size, 16);
        assert_eq!(config.api.http_port, 8080);
    }

    #[test]
    fn test_claim_ttl_must_cover_slowest_step() {
        let mut config = AppConfig::default();
        // 3 x 10s timeouts plus 200ms and 400ms of backoff.
        assert_eq!(config.worst_case_step_ms(), 30_600);
        assert!(config.validate().is_ok());

        config.automation.claim_ttl_secs = 30;
        assert!(matches!(config.validate(), Err(CoreError::Invalid(_))));

        config.webhook.timeout_ms = 1_000;
        assert!(config.validate().is_ok());
    }
}
