//! Service configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use feedrelay_core::{Credential, SendOptions, Topic};
use feedrelay_http::ClientConfig;
use feedrelay_pipeline::{PipelineConfig, PollerConfig};
use feedrelay_reliability::{CircuitConfig, QueueConfig, RotatorConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};

const CONFIG_FILE: &str = "feedrelay.toml";
const ENV_PREFIX: &str = "FEEDRELAY_";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// How accepted items reach the downstream channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Through the paced delivery queue
    #[default]
    Queued,
    /// Sent inline by the last pipeline stage
    Direct,
}

/// Complete service configuration.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed with `FEEDRELAY_` (highest priority)
/// 2. Configuration file (`feedrelay.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Topics are only read from the file (`[[topics]]` tables). Credentials
/// may come from the file or from `FEEDRELAY_CREDENTIALS` as a
/// comma-separated list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Logging
    /// Log output format.
    pub log_format: LogFormat,

    // Collaborators
    /// Base URL of the upstream search API.
    pub upstream_url: String,
    /// Base URL of the downstream webhook.
    pub downstream_url: String,
    /// Bearer token for the downstream webhook.
    pub downstream_token: Option<String>,
    /// HTTP request timeout in seconds.
    pub http_timeout_secs: u64,

    // Polling
    /// Upstream credential pool.
    #[serde(deserialize_with = "comma_separated")]
    pub credentials: Vec<String>,
    /// Topics to poll.
    pub topics: Vec<Topic>,
    /// Pause between polling cycles in seconds.
    pub poll_interval_secs: u64,
    /// Pause between items of one page in milliseconds.
    pub item_pacing_ms: u64,
    /// Pause between topics in milliseconds.
    pub topic_pacing_ms: u64,
    /// Oldest item accepted, in minutes.
    pub max_age_minutes: u64,

    // Delivery
    /// Queue or send inline.
    pub delivery_mode: DeliveryMode,
    /// Deliver without notifying recipients.
    pub silent: bool,
    /// Markup dialect forwarded to the downstream.
    pub parse_mode: Option<String>,

    // Stage retries
    /// Base delay of the stage retry backoff in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Cap of the stage retry backoff in milliseconds.
    pub retry_max_delay_ms: u64,
    /// Jitter fraction (0.0 to 1.0) applied to stage retry waits.
    pub retry_jitter_factor: f64,
    /// Attempts for the inline send stage.
    pub send_max_attempts: u32,
    /// Per-attempt timeout of the inline send stage in seconds.
    pub send_timeout_secs: u64,

    // Circuit breaker
    /// Systemic failures before a circuit opens.
    pub circuit_failure_threshold: u32,
    /// Seconds an open circuit waits before admitting a trial.
    pub circuit_reset_timeout_secs: u64,
    /// Seconds between half-open trials.
    pub circuit_test_interval_secs: u64,

    // Credential rotation
    /// Minimum throttle cooldown in seconds.
    pub rotator_cooldown_secs: u64,
    /// Extra cooldown per pool index in seconds.
    pub rotator_stagger_secs: u64,
    /// Consecutive failures that make a credential unhealthy.
    pub rotator_max_consecutive_failures: u32,
    /// Recent errors that make a credential unhealthy.
    pub rotator_error_threshold: u32,
    /// Window in seconds in which errors count as recent.
    pub rotator_health_window_secs: u64,
    /// Seconds between stale health resets.
    pub rotator_health_reset_interval_secs: u64,

    // Delivery queue
    /// Floor of the queue pacing delay in milliseconds.
    pub queue_base_delay_ms: u64,
    /// Ceiling of the queue pacing delay in milliseconds.
    pub queue_max_delay_ms: u64,
    /// Failed sends before a message is dead-lettered.
    pub queue_max_retries: u32,
    /// Queue tick in milliseconds.
    pub queue_tick_interval_ms: u64,
    /// Quiet seconds after a throttle before the delay decays.
    pub queue_decay_after_secs: u64,
    /// Dead letters kept for inspection.
    pub queue_dead_letter_capacity: usize,

    /// Grace period for background tasks on shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            upstream_url: "http://127.0.0.1:8081".to_string(),
            downstream_url: "http://127.0.0.1:8082".to_string(),
            downstream_token: None,
            http_timeout_secs: 30,
            credentials: Vec::new(),
            topics: Vec::new(),
            poll_interval_secs: 60,
            item_pacing_ms: 1000,
            topic_pacing_ms: 2000,
            max_age_minutes: 60,
            delivery_mode: DeliveryMode::default(),
            silent: false,
            parse_mode: None,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            retry_jitter_factor: 0.0,
            send_max_attempts: 5,
            send_timeout_secs: 30,
            circuit_failure_threshold: 5,
            circuit_reset_timeout_secs: 60,
            circuit_test_interval_secs: 30,
            rotator_cooldown_secs: 60,
            rotator_stagger_secs: 5,
            rotator_max_consecutive_failures: 3,
            rotator_error_threshold: 10,
            rotator_health_window_secs: 600,
            rotator_health_reset_interval_secs: 300,
            queue_base_delay_ms: 1000,
            queue_max_delay_ms: 60_000,
            queue_max_retries: 3,
            queue_tick_interval_ms: 100,
            queue_decay_after_secs: 10,
            queue_dead_letter_capacity: 1000,
            shutdown_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Loads configuration from defaults, `feedrelay.toml` and the environment.
    pub fn load() -> Result<Self> {
        Self::from_figment(Self::figment())
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.credentials.is_empty() {
            anyhow::bail!("at least one upstream credential is required");
        }

        if self.topics.is_empty() {
            anyhow::bail!("at least one topic is required");
        }

        if let Some(topic) = self.topics.iter().find(|t| t.destination.trim().is_empty()) {
            anyhow::bail!("topic '{}' has no destination", topic.scope);
        }

        if self.http_timeout_secs == 0 {
            anyhow::bail!("http_timeout_secs must be greater than 0");
        }

        if self.send_max_attempts == 0 {
            anyhow::bail!("send_max_attempts must be greater than 0");
        }

        if self.circuit_failure_threshold == 0 {
            anyhow::bail!("circuit_failure_threshold must be greater than 0");
        }

        if self.queue_max_retries == 0 {
            anyhow::bail!("queue_max_retries must be greater than 0");
        }

        if self.queue_base_delay_ms > self.queue_max_delay_ms {
            anyhow::bail!("queue_base_delay_ms cannot exceed queue_max_delay_ms");
        }

        if self.queue_tick_interval_ms == 0 {
            anyhow::bail!("queue_tick_interval_ms must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        Ok(())
    }

    /// Upstream credential pool in configured order.
    pub fn credentials(&self) -> Vec<Credential> {
        self.credentials.iter().map(Credential::new).collect()
    }

    /// Options attached to every outbound message.
    pub fn send_options(&self) -> SendOptions {
        SendOptions { silent: self.silent, parse_mode: self.parse_mode.clone() }
    }

    /// Age window of the pipeline.
    pub const fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_minutes.saturating_mul(60))
    }

    /// Grace period for background tasks on shutdown.
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Converts to a circuit breaker configuration.
    pub const fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            threshold: self.circuit_failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_reset_timeout_secs),
            test_interval: Duration::from_secs(self.circuit_test_interval_secs),
        }
    }

    /// Converts to a credential rotator configuration.
    pub const fn to_rotator_config(&self) -> RotatorConfig {
        RotatorConfig {
            cooldown: Duration::from_secs(self.rotator_cooldown_secs),
            stagger: Duration::from_secs(self.rotator_stagger_secs),
            max_consecutive_failures: self.rotator_max_consecutive_failures,
            error_threshold: self.rotator_error_threshold,
            health_window: Duration::from_secs(self.rotator_health_window_secs),
            health_reset_interval: Duration::from_secs(self.rotator_health_reset_interval_secs),
        }
    }

    /// Converts to a delivery queue configuration.
    pub const fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            base_delay: Duration::from_millis(self.queue_base_delay_ms),
            max_delay: Duration::from_millis(self.queue_max_delay_ms),
            max_retries: self.queue_max_retries,
            tick_interval: Duration::from_millis(self.queue_tick_interval_ms),
            decay_after: Duration::from_secs(self.queue_decay_after_secs),
            dead_letter_capacity: self.queue_dead_letter_capacity,
        }
    }

    /// Converts to a pipeline configuration.
    pub const fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            retry_base: Duration::from_millis(self.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
            retry_jitter: self.retry_jitter_factor,
            send_max_attempts: self.send_max_attempts,
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }

    /// Converts to a poller configuration.
    pub const fn to_poller_config(&self) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(self.poll_interval_secs),
            item_pacing: Duration::from_millis(self.item_pacing_ms),
            topic_pacing: Duration::from_millis(self.topic_pacing_ms),
        }
    }

    /// Converts to an HTTP client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..ClientConfig::default()
        }
    }
}

/// Accepts a list or a comma-separated string.
fn comma_separated<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrString {
        List(Vec<String>),
        String(String),
    }

    let values = match ListOrString::deserialize(deserializer)? {
        ListOrString::List(values) => values,
        ListOrString::String(joined) => joined.split(',').map(str::to_string).collect(),
    };

    Ok(values.into_iter().map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
}
