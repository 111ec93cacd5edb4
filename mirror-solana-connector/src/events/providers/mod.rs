//! Log feeds for the event pipeline.
//!
//! A provider delivers each transaction's logs to a [`LogSink`] from its own
//! background task. Once `unsubscribe` returns the sink is never called again.

mod polling;
mod relay;
mod websocket;

pub use polling::{PollingLogOptions, PollingLogProvider};
pub use relay::{RelayLogOptions, RelayLogProvider, RelayMessage};
pub use websocket::{WebSocketLogOptions, WebSocketLogProvider};

use crate::{
    config::LogProviderConfig,
    error::{SyncResult, TransportError},
    transport::{relay::WebSocketRelaySource, LogHistory, LogPubsub, TransactionLogs},
};
use async_trait::async_trait;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{sync::Arc, time::Duration};

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);
const INITIAL_RECONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum ProviderMessage {
    Transaction(TransactionLogs),
    /// A failure the provider recovered from, or the one that made it stop.
    Error(TransportError),
}

pub type LogSink = Arc<dyn Fn(ProviderMessage) + Send + Sync>;

#[async_trait]
pub trait LogProvider: Send + Sync {
    /// Starts delivering to `sink`. A no-op while already subscribed.
    async fn subscribe(&self, sink: LogSink) -> SyncResult<()>;

    async fn unsubscribe(&self);

    fn is_subscribed(&self) -> bool;
}

/// Clients a provider may need, depending on its kind.
#[derive(Clone)]
pub struct LogTransports {
    pub pubsub: Arc<dyn LogPubsub>,
    pub history: Arc<dyn LogHistory>,
}

/// Builds the provider selected by `config` for logs mentioning `address`.
pub fn build_log_provider(
    config: &LogProviderConfig,
    address: Pubkey,
    commitment: CommitmentLevel,
    transports: LogTransports,
) -> Arc<dyn LogProvider> {
    match config {
        LogProviderConfig::Websocket {
            resub_timeout_ms,
            max_reconnect_attempts,
            fallback,
        } => {
            let options = WebSocketLogOptions {
                resub_timeout: resub_timeout_ms.map(Duration::from_millis),
                max_reconnect_attempts: *max_reconnect_attempts,
                fallback: fallback.as_ref().map(PollingLogOptions::from),
            };
            Arc::new(WebSocketLogProvider::new(
                address,
                commitment,
                transports.pubsub,
                Some(transports.history),
                options,
            ))
        }
        LogProviderConfig::Polling(polling) => Arc::new(PollingLogProvider::new(
            address,
            commitment,
            transports.history,
            PollingLogOptions::from(polling),
        )),
        LogProviderConfig::Relay {
            url,
            resub_timeout_ms,
            max_reconnect_attempts,
        } => {
            let options = RelayLogOptions {
                resub_timeout: resub_timeout_ms.map(Duration::from_millis),
                max_reconnect_attempts: *max_reconnect_attempts,
            };
            Arc::new(RelayLogProvider::new(
                Arc::new(WebSocketRelaySource::new(url.clone())),
                options,
            ))
        }
    }
}
