//! A client-side synchronization layer for Solana programs.
//!
//! This crate keeps a local, decoded mirror of on-chain accounts and a local,
//! ordered history of program events up to date over whichever transport is
//! available, while tolerating stale, duplicated and out-of-order deliveries.
//!
//! # Key Components
//!
//! *   [`accounts`]: Single-account subscribers (push, multiplexed stream, bulk
//!     polling, one-shot) behind the [`accounts::AccountSubscriber`] trait.
//! *   [`bulk_loader::BulkAccountLoader`]: Batches many polled accounts into few
//!     `getMultipleAccounts` round trips.
//! *   [`multiplexer::MultiplexedSubscriber`]: One stream session over a dynamic
//!     set of keys.
//! *   [`events::EventSubscriber`]: Parses program logs into bounded, ordered,
//!     per-type event histories with transaction lookup.
//! *   [`transport`]: The capabilities the components drive, with Solana
//!     implementations.

pub mod accounts;
pub mod bulk_loader;
/// Defines configuration structures for the connector.
pub mod config;
/// Pluggable decoding of account bytes.
pub mod decode;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod observation;
pub mod observer;
pub mod transport;
mod util;

pub use error::{DecodeError, LoaderError, SyncError, SyncResult, TransportError};
pub use observation::{RawObservation, Slot, VersionedValue};
