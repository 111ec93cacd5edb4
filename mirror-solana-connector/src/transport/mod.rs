//! # Transport Boundary
//!
//! The connector drives remote state through a handful of capabilities rather than
//! concrete clients. Each capability is an `async_trait` so production code can use
//! the Solana RPC/PubSub clients in [`solana`] while tests plug in in-memory doubles.
//!
//! - [`AccountRpc`]: point and batched account reads.
//! - [`AccountPubsub`]: push notifications for one account.
//! - [`StreamTransport`]: one bidirectional session carrying many accounts, with a
//!   server-side key filter that can be rewritten while the session stays open.
//! - [`LogPubsub`] / [`LogHistory`]: live and historical transaction logs.
//! - [`RelaySource`]: text frames from an external log relay.
//!
//! Dropping a returned stream releases the underlying subscription.

pub mod relay;
pub mod solana;

use crate::{
    error::TransportError,
    observation::{RawObservation, Slot},
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey, signature::Signature};
use tokio::sync::mpsc;

pub type NotificationStream = BoxStream<'static, RawObservation>;
pub type LogStream = BoxStream<'static, TransactionLogs>;

/// Result of one batched read: the context slot and one entry per requested key,
/// in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipleAccounts {
    pub slot: Slot,
    pub accounts: Vec<Option<Vec<u8>>>,
}

#[async_trait]
pub trait AccountRpc: Send + Sync {
    async fn get_account(
        &self,
        key: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<RawObservation, TransportError>;

    async fn get_multiple_accounts(
        &self,
        keys: &[Pubkey],
        commitment: CommitmentLevel,
    ) -> Result<MultipleAccounts, TransportError>;
}

#[async_trait]
pub trait AccountPubsub: Send + Sync {
    /// Opens a push subscription for `key`. The stream ends when the server drops it.
    async fn account_subscribe(
        &self,
        key: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<NotificationStream, TransportError>;
}

/// Server-side filter of a multiplexed session. A new filter replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRequest {
    pub accounts: Vec<Pubkey>,
    pub commitment: CommitmentLevel,
}

/// Requests written to an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Filter(FilterRequest),
    Ping { id: u32 },
}

/// Frames read from an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Account {
        key: Pubkey,
        slot: Slot,
        data: Vec<u8>,
    },
    /// Server keepalive; answered with a ping request.
    Ping,
    Pong {
        id: u32,
    },
}

/// An open multiplexed session.
pub struct StreamSession {
    pub requests: mpsc::Sender<SessionRequest>,
    pub frames: BoxStream<'static, Result<StreamFrame, TransportError>>,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Opens a session whose first request is `initial`.
    async fn open(&self, initial: FilterRequest) -> Result<StreamSession, TransportError>;
}

/// Log lines of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLogs {
    pub signature: Signature,
    pub slot: Slot,
    /// Execution error, if the transaction failed.
    pub err: Option<String>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signature: Signature,
    pub slot: Slot,
    pub err: Option<String>,
}

#[async_trait]
pub trait LogPubsub: Send + Sync {
    async fn logs_subscribe(
        &self,
        address: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<LogStream, TransportError>;
}

#[async_trait]
pub trait LogHistory: Send + Sync {
    /// Signatures mentioning `address`, newest first. `before` and `until` are exclusive.
    async fn get_signatures(
        &self,
        address: &Pubkey,
        before: Option<Signature>,
        until: Option<Signature>,
        limit: usize,
        commitment: CommitmentLevel,
    ) -> Result<Vec<SignatureInfo>, TransportError>;

    /// Logs of one transaction, or `None` if the node no longer has them.
    async fn get_transaction_logs(
        &self,
        signature: &Signature,
        commitment: CommitmentLevel,
    ) -> Result<Option<TransactionLogs>, TransportError>;
}

pub type RelayStream = BoxStream<'static, Result<String, TransportError>>;

#[async_trait]
pub trait RelaySource: Send + Sync {
    /// Connects to the relay and yields its text frames.
    async fn connect(&self) -> Result<RelayStream, TransportError>;
}
