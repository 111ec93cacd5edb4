use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::commitment_config::CommitmentLevel;
use std::time::Duration;

use crate::events::{OrderBy, OrderDir};

/// The top-level configuration for the `mirror-solana-connector` library.
///
/// This struct aggregates the Solana endpoints and the tuning knobs of every
/// subscriber family. It is typically deserialized from a configuration file with
/// [`load_config`] and handed to the components that need it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectorConfig {
    #[serde(default)]
    pub solana: Solana,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Defines the connection settings for the Solana cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Solana {
    pub rpc_url: String,
    pub ws_url: String,
    #[serde(with = "serde_commitment")]
    pub commitment: CommitmentLevel,
}

/// Settings shared by the single-account subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AccountsConfig {
    /// Resubscribe when no notification arrives for this long. `None` disables it.
    pub resub_timeout_ms: Option<u64>,
    /// When set, a stale push subscription falls back to polling at this interval
    /// instead of resubscribing blindly.
    pub polling_fallback_ms: Option<u64>,
    /// How many times a dropped push subscription is reopened before giving up.
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
}

/// Settings for the bulk polling loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LoaderConfig {
    pub polling_frequency_ms: u64,
    /// Maximum number of keys per `getMultipleAccounts` request.
    pub chunk_size: usize,
    /// Maximum number of chunk requests in flight during one load cycle.
    pub max_concurrent_chunks: usize,
}

/// Settings for the multiplexed stream subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MultiplexerConfig {
    /// Window during which key additions are coalesced into one filter update.
    pub debounce_ms: u64,
    pub ping_interval_ms: u64,
    pub initial_reconnect_backoff_ms: u64,
    pub max_reconnect_backoff_ms: u64,
}

/// Settings for the event pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EventsConfig {
    /// Event type names to retain. Empty keeps every type.
    pub event_types: Vec<String>,
    pub max_events_per_type: usize,
    /// Capacity of the transaction-keyed LRU cache.
    pub max_tx: usize,
    pub order_by: OrderBy,
    pub order_dir: OrderDir,
    pub skip_failed_transactions: bool,
    /// Page size used when walking history backwards.
    pub backfill_page_size: usize,
    pub log_provider: LogProviderConfig,
}

/// Selects and tunes the log feed of the event pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LogProviderConfig {
    #[serde(rename_all = "kebab-case")]
    Websocket {
        #[serde(default)]
        resub_timeout_ms: Option<u64>,
        #[serde(default = "default_log_reconnect_attempts")]
        max_reconnect_attempts: u32,
        /// Polling settings used once reconnect attempts are exhausted.
        #[serde(default)]
        fallback: Option<PollingLogConfig>,
    },
    Polling(PollingLogConfig),
    #[serde(rename_all = "kebab-case")]
    Relay {
        url: String,
        #[serde(default)]
        resub_timeout_ms: Option<u64>,
        #[serde(default = "default_log_reconnect_attempts")]
        max_reconnect_attempts: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PollingLogConfig {
    pub frequency_ms: u64,
    pub batch_size: usize,
}

fn default_log_reconnect_attempts() -> u32 {
    5
}

impl Default for Solana {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8899".to_string(),
            ws_url: "ws://127.0.0.1:8900".to_string(),
            commitment: CommitmentLevel::Confirmed,
        }
    }
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            resub_timeout_ms: None,
            polling_fallback_ms: None,
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 500,
        }
    }
}

impl AccountsConfig {
    pub fn resub_timeout(&self) -> Option<Duration> {
        self.resub_timeout_ms.map(Duration::from_millis)
    }

    pub fn polling_fallback(&self) -> Option<Duration> {
        self.polling_fallback_ms.map(Duration::from_millis)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            polling_frequency_ms: 1_000,
            chunk_size: 99,
            max_concurrent_chunks: 10,
        }
    }
}

impl LoaderConfig {
    pub fn polling_frequency(&self) -> Duration {
        Duration::from_millis(self.polling_frequency_ms)
    }
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            ping_interval_ms: 10_000,
            initial_reconnect_backoff_ms: 250,
            max_reconnect_backoff_ms: 30_000,
        }
    }
}

impl MultiplexerConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn initial_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_backoff_ms)
    }

    pub fn max_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_backoff_ms)
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            event_types: Vec::new(),
            max_events_per_type: 4096,
            max_tx: 4096,
            order_by: OrderBy::default(),
            order_dir: OrderDir::default(),
            skip_failed_transactions: true,
            backfill_page_size: 1000,
            log_provider: LogProviderConfig::default(),
        }
    }
}

impl Default for LogProviderConfig {
    fn default() -> Self {
        LogProviderConfig::Websocket {
            resub_timeout_ms: None,
            max_reconnect_attempts: default_log_reconnect_attempts(),
            fallback: Some(PollingLogConfig::default()),
        }
    }
}

impl Default for PollingLogConfig {
    fn default() -> Self {
        Self {
            frequency_ms: 1_000,
            batch_size: 100,
        }
    }
}

/// Loads the connector configuration from a TOML file.
///
/// Values may be overridden through `MIRROR__<SECTION>__<KEY>` environment variables.
pub fn load_config(path: &str) -> Result<ConnectorConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("MIRROR").separator("__"));

    let settings: ConnectorConfig = builder
        .build()
        .context(format!("Failed to build configuration from '{}'", path))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}

mod serde_commitment {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(c: &CommitmentLevel, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = match c {
            CommitmentLevel::Processed => "processed",
            CommitmentLevel::Confirmed => "confirmed",
            CommitmentLevel::Finalized => "finalized",
        };
        serializer.serialize_str(s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<CommitmentLevel, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "processed" => Ok(CommitmentLevel::Processed),
            "confirmed" => Ok(CommitmentLevel::Confirmed),
            "finalized" => Ok(CommitmentLevel::Finalized),
            other => Err(serde::de::Error::custom(format!(
                "unknown commitment level '{}'",
                other
            ))),
        }
    }
}
