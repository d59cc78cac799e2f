//! Global configuration parsing, validation, and credential loading.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::{AppError, Result};

const KEYRING_SERVICE: &str = "interaction-relay";

/// Minimum gap between the delivery timeout and the stale-claim age.
///
/// Covers the store reads and writes around the webhook call.
pub const STALE_CLAIM_MARGIN_SECONDS: u64 = 60;

/// Broker connection and delay-topology naming.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BrokerConfig {
    /// AMQP URI; when omitted it is loaded from keychain or `RELAY_AMQP_URI`.
    #[serde(default)]
    pub uri: Option<String>,
    /// Direct exchange that receives ready (dead-lettered) messages.
    #[serde(default = "default_ready_exchange")]
    pub ready_exchange: String,
    /// Durable queue consumed by the broker consumer.
    #[serde(default = "default_destination_queue")]
    pub destination_queue: String,
    /// Base name of the delay queue(s).
    #[serde(default = "default_delay_queue")]
    pub delay_queue: String,
    /// Routing key binding the destination queue to the ready exchange.
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// Upper bounds (seconds) of the delay tiers; empty selects a single delay queue.
    #[serde(default = "default_delay_tiers")]
    pub delay_tiers_seconds: Vec<u64>,
    /// Maximum unacknowledged deliveries per consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
}

fn default_ready_exchange() -> String {
    "interactions.ready".into()
}

fn default_destination_queue() -> String {
    "interactions.scheduled".into()
}

fn default_delay_queue() -> String {
    "interactions.delay".into()
}

fn default_routing_key() -> String {
    "scheduled".into()
}

fn default_delay_tiers() -> Vec<u64> {
    vec![10, 60, 600, 3600, 86_400]
}

fn default_prefetch() -> u16 {
    10
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            uri: None,
            ready_exchange: default_ready_exchange(),
            destination_queue: default_destination_queue(),
            delay_queue: default_delay_queue(),
            routing_key: default_routing_key(),
            delay_tiers_seconds: default_delay_tiers(),
            prefetch: default_prefetch(),
        }
    }
}

/// Reconciling poller cadence and bounds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct PollerConfig {
    /// Whether the background poller runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between ticks.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Maximum due rows fetched per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Maximum concurrent deliveries within a tick.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Age after which a row stuck in `claimed` is failed; must outlast a
    /// delivery by at least [`STALE_CLAIM_MARGIN_SECONDS`].
    #[serde(default = "default_stale_claim_seconds")]
    pub stale_claim_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_batch_size() -> u32 {
    50
}

fn default_max_concurrency() -> usize {
    4
}

fn default_stale_claim_seconds() -> u64 {
    900
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_interval_seconds(),
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            stale_claim_seconds: default_stale_claim_seconds(),
        }
    }
}

/// Delivery webhook settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct DeliveryConfig {
    /// Default webhook URL; an AI configuration may override it.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Request timeout for one delivery call.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// How far ahead of `scheduled_at` a claim may still succeed.
    #[serde(default = "default_early_tolerance_ms")]
    pub early_tolerance_ms: u64,
    /// Bearer token sent to the webhook (populated at runtime).
    #[serde(skip)]
    pub webhook_token: Option<String>,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_early_tolerance_ms() -> u64 {
    1000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_seconds: default_timeout_seconds(),
            early_tolerance_ms: default_early_tolerance_ms(),
            webhook_token: None,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/interaction-relay.db")
}

fn default_http_port() -> u16 {
    8080
}

fn default_ipc_name() -> String {
    "interaction-relay".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// `SQLite` database file backing the Durable Store.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// HTTP port for the scheduling API.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Named pipe / Unix socket identifier for `interaction-relay-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Broker connectivity and topology.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Reconciling poller settings.
    #[serde(default)]
    pub poller: PollerConfig,
    /// Delivery webhook settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Shared secret required on IPC commands (populated at runtime).
    #[serde(skip)]
    pub ipc_auth_token: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            http_port: default_http_port(),
            ipc_name: default_ipc_name(),
            broker: BrokerConfig::default(),
            poller: PollerConfig::default(),
            delivery: DeliveryConfig::default(),
            ipc_auth_token: None,
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load secrets from the OS keychain with env-var fallback.
    ///
    /// The AMQP URI is required unless already present in the TOML file.
    /// The webhook and IPC tokens are optional.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if no AMQP URI can be found.
    pub async fn load_credentials(&mut self) -> Result<()> {
        if self.broker.uri.is_none() {
            let uri = load_credential("amqp_uri", "RELAY_AMQP_URI")
                .await?
                .ok_or_else(|| {
                    AppError::Config(
                        "credential amqp_uri not found in config, keychain or RELAY_AMQP_URI env var"
                            .into(),
                    )
                })?;
            self.broker.uri = Some(uri);
        }

        self.delivery.webhook_token = load_credential("webhook_token", "RELAY_WEBHOOK_TOKEN").await?;
        if self.delivery.webhook_token.is_none() {
            info!("no webhook token configured; deliveries are sent unauthenticated");
        }

        self.ipc_auth_token = load_credential("ipc_token", "RELAY_IPC_TOKEN").await?;
        if self.ipc_auth_token.is_none() {
            warn!("no ipc token configured; ipc commands are accepted from any local client");
        }
        Ok(())
    }

    /// Poll cadence as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.interval_seconds)
    }

    /// Delivery request timeout as a [`Duration`].
    #[must_use]
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery.timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.poller.batch_size == 0 {
            return Err(AppError::Config(
                "poller.batch_size must be greater than zero".into(),
            ));
        }

        if self.poller.max_concurrency == 0 {
            return Err(AppError::Config(
                "poller.max_concurrency must be greater than zero".into(),
            ));
        }

        if self.poller.interval_seconds == 0 {
            return Err(AppError::Config(
                "poller.interval_seconds must be greater than zero".into(),
            ));
        }

        if self.delivery.timeout_seconds == 0 {
            return Err(AppError::Config(
                "delivery.timeout_seconds must be greater than zero".into(),
            ));
        }

        let min_stale = self
            .delivery
            .timeout_seconds
            .saturating_add(STALE_CLAIM_MARGIN_SECONDS);
        if self.poller.stale_claim_seconds < min_stale {
            return Err(AppError::Config(format!(
                "poller.stale_claim_seconds must be at least delivery.timeout_seconds + \
                 {STALE_CLAIM_MARGIN_SECONDS} ({min_stale})"
            )));
        }

        let names = [
            ("broker.ready_exchange", &self.broker.ready_exchange),
            ("broker.destination_queue", &self.broker.destination_queue),
            ("broker.delay_queue", &self.broker.delay_queue),
            ("broker.routing_key", &self.broker.routing_key),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(AppError::Config(format!("{field} must not be empty")));
            }
        }

        let tiers = &self.broker.delay_tiers_seconds;
        if tiers.first() == Some(&0) {
            return Err(AppError::Config(
                "broker.delay_tiers_seconds entries must be greater than zero".into(),
            ));
        }
        if tiers.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(AppError::Config(
                "broker.delay_tiers_seconds must be strictly increasing".into(),
            ));
        }

        if let Some(ref url) = self.delivery.webhook_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AppError::Config(format!(
                    "delivery.webhook_url must be an http(s) url: {url}"
                )));
            }
        }

        Ok(())
    }
}

/// Load a single credential from OS keychain with env-var fallback.
///
/// Returns `Ok(None)` when neither source has a non-empty value.
async fn load_credential(keyring_key: &str, env_key: &str) -> Result<Option<String>> {
    let key = keyring_key.to_owned();

    // keyring is synchronous I/O.
    let keychain_result = tokio::task::spawn_blocking(move || {
        keyring::Entry::new(KEYRING_SERVICE, &key).and_then(|entry| entry.get_password())
    })
    .await
    .map_err(|err| AppError::Config(format!("keychain task panicked: {err}")))?;

    match keychain_result {
        Ok(value) if !value.is_empty() => return Ok(Some(value)),
        Ok(_) => {
            warn!(key = keyring_key, "keychain entry is empty, trying env var");
        }
        Err(err) => {
            warn!(
                key = keyring_key,
                ?err,
                "keychain lookup failed, trying env var"
            );
        }
    }

    Ok(env::var(env_key).ok().filter(|value| !value.is_empty()))
}
