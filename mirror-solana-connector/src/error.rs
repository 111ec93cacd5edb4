use solana_client::{client_error::ClientError, nonblocking::pubsub_client::PubsubClientError};
use std::time::Duration;
use thiserror::Error;

/// Failure to turn raw account or event bytes into a typed value.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("account data does not carry the {account_type} discriminator")]
    Discriminator { account_type: String },

    #[error("failed to decode {account_type}: {reason}")]
    Invalid { account_type: String, reason: String },
}

/// Read/write failures of the transports the connector drives.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("RPC request failed: {0}")]
    Rpc(#[from] ClientError),

    #[error("subscription failed: {0}")]
    Pubsub(#[from] PubsubClientError),

    #[error("relay connection failed: {0}")]
    Relay(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),

    #[error("transport closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by subscribers, the bulk loader and the event pipeline.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("subscriber is not active; call subscribe() first")]
    NotSubscribed,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Batch(#[from] LoaderError),

    #[error("no update received for {0:?}")]
    Stale(Duration),

    #[error("subscription was cancelled")]
    Cancelled,
}

pub type SyncResult<T> = Result<T, SyncError>;

/// A batched read that failed for one chunk of watched keys.
///
/// The keys are retried on the next load cycle.
#[derive(Error, Debug, Clone)]
#[error("batched read of {} accounts failed: {source}", .keys.len())]
pub struct LoaderError {
    pub keys: Vec<solana_sdk::pubkey::Pubkey>,
    pub source: std::sync::Arc<TransportError>,
}
