//! # Account Synchronization Engine
//!
//! Single-account subscribers that keep a decoded, slot-versioned mirror of one
//! on-chain account. Every strategy implements [`AccountSubscriber`] and shares the
//! same state machine and dedup/decode contract; they differ only in the transport
//! they drive:
//!
//! - [`WebSocketAccountSubscriber`]: push notifications, with an optional staleness
//!   timeout that resubscribes or falls back to polling.
//! - [`StreamAccountSubscriber`]: joins a shared [`MultiplexedSubscriber`](crate::multiplexer::MultiplexedSubscriber).
//! - [`PollingAccountSubscriber`]: joins a shared [`BulkAccountLoader`](crate::bulk_loader::BulkAccountLoader).
//! - [`OneShotAccountSubscriber`]: reads once on subscribe and on every `fetch()`.
//!
//! An observation replaces the cached one only if its slot is strictly greater and
//! its bytes differ, so consumers see non-decreasing slots and no repeats.

mod shared;
mod one_shot;
mod polling;
mod stream;
mod websocket;

pub use one_shot::OneShotAccountSubscriber;
pub use polling::PollingAccountSubscriber;
pub use stream::{StreamAccountSubscriber, StreamSubscriberOptions};
pub use websocket::{PollingFallback, WebSocketAccountSubscriber, WebSocketSubscriberOptions};

use crate::{
    error::{SyncError, SyncResult},
    observation::{Slot, VersionedValue},
    observer::{Listener, ListenerId},
};
use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;

/// Consumer callback invoked with each newly accepted decoded value.
pub type OnChange<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Lifecycle of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Idle,
    Subscribing,
    Active,
    Unsubscribing,
}

/// Signals emitted to a subscriber's listeners.
#[derive(Debug, Clone)]
pub enum AccountEvent {
    /// A new observation was accepted for `key`.
    Updated { key: Pubkey, slot: Slot },
    /// A notification or transport failure that did not end the subscription.
    Error { key: Pubkey, error: Arc<SyncError> },
}

/// The common contract of every account subscriber strategy.
#[async_trait]
pub trait AccountSubscriber<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &Pubkey;

    /// Starts the subscription. Idempotent while subscribing, active, or unsubscribing.
    ///
    /// If nothing has been observed yet, one read seeds the state before the live
    /// transport opens. A failed seed is returned and leaves the subscriber idle.
    async fn subscribe(&self, on_change: OnChange<T>) -> SyncResult<()>;

    /// Reads the account once and applies the result under the usual dedup rule.
    async fn fetch(&self) -> SyncResult<()>;

    /// Tears the subscription down. Safe from any state; no callback fires after it returns.
    async fn unsubscribe(&self);

    fn current(&self) -> Option<VersionedValue<T>>;

    /// Fails with [`SyncError::NotSubscribed`] unless the subscription is active.
    fn assert_active(&self) -> SyncResult<()>;

    fn state(&self) -> SubscriptionState;

    fn add_listener(&self, listener: Listener<AccountEvent>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}
