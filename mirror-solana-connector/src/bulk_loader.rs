//! # Bulk Polling Loader
//!
//! A shared batching service: every registered key is read with
//! `getMultipleAccounts`, `chunk_size` keys per request, and the callbacks bound to
//! a key run only when its observation passes the dedup rule. Many
//! [`PollingAccountSubscriber`](crate::accounts::PollingAccountSubscriber)s share one
//! loader so N accounts cost `ceil(N / chunk_size)` round trips per tick.

use crate::{
    config::LoaderConfig,
    error::{LoaderError, SyncResult, TransportError},
    observation::{replace_if_newer, RawObservation, Slot},
    transport::{AccountRpc, MultipleAccounts},
    util::{lock, TaskHandle},
};
use dashmap::DashMap;
use futures::{stream, StreamExt};
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Identifies a registered account or error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

pub type LoaderCallback = Arc<dyn Fn(&RawObservation) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&LoaderError) + Send + Sync>;

#[derive(Default)]
struct WatchedAccount {
    buffer: Option<RawObservation>,
    callbacks: HashMap<CallbackId, LoaderCallback>,
}

struct LoaderInner {
    rpc: Arc<dyn AccountRpc>,
    commitment: CommitmentLevel,
    chunk_size: usize,
    max_concurrent_chunks: usize,
    polling_frequency: Mutex<Duration>,
    accounts: DashMap<Pubkey, WatchedAccount>,
    error_callbacks: DashMap<CallbackId, ErrorCallback>,
    next_id: AtomicU64,
    loading: AtomicBool,
    most_recent_slot: AtomicU64,
    poller: Mutex<Option<TaskHandle>>,
}

/// Cheaply cloneable handle to one shared loader.
#[derive(Clone)]
pub struct BulkAccountLoader(Arc<LoaderInner>);

/// Clears the in-flight flag when a load cycle ends, however it ends.
struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl BulkAccountLoader {
    pub fn new(rpc: Arc<dyn AccountRpc>, commitment: CommitmentLevel, config: &LoaderConfig) -> Self {
        Self(Arc::new(LoaderInner {
            rpc,
            commitment,
            chunk_size: config.chunk_size.max(1),
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
            polling_frequency: Mutex::new(config.polling_frequency()),
            accounts: DashMap::new(),
            error_callbacks: DashMap::new(),
            next_id: AtomicU64::new(1),
            loading: AtomicBool::new(false),
            most_recent_slot: AtomicU64::new(0),
            poller: Mutex::new(None),
        }))
    }

    pub fn commitment(&self) -> CommitmentLevel {
        self.0.commitment
    }

    fn next_id(&self) -> CallbackId {
        CallbackId(self.0.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers `callback` for `key`, adding the key to the watch set if needed.
    pub fn add_account(&self, key: Pubkey, callback: LoaderCallback) -> CallbackId {
        let id = self.next_id();
        self.0
            .accounts
            .entry(key)
            .or_default()
            .callbacks
            .insert(id, callback);
        tracing::debug!(%key, ?id, "Account added to bulk loader");
        id
    }

    /// Removes one callback. The key leaves the watch set with its last callback,
    /// and polling stops once no key is left. Idempotent.
    pub fn remove_account(&self, key: &Pubkey, id: CallbackId) {
        let removed_key = self
            .0
            .accounts
            .remove_if_mut(key, |_, watched| {
                watched.callbacks.remove(&id);
                watched.callbacks.is_empty()
            })
            .is_some();

        if removed_key {
            tracing::debug!(%key, "Account removed from bulk loader");
            if self.0.accounts.is_empty() {
                self.stop_polling();
            }
        }
    }

    pub fn add_error_callback(&self, callback: ErrorCallback) -> CallbackId {
        let id = self.next_id();
        self.0.error_callbacks.insert(id, callback);
        id
    }

    pub fn remove_error_callback(&self, id: CallbackId) {
        self.0.error_callbacks.remove(&id);
    }

    pub fn watched_keys(&self) -> Vec<Pubkey> {
        let mut keys: Vec<Pubkey> = self.0.accounts.iter().map(|entry| *entry.key()).collect();
        keys.sort();
        keys
    }

    /// The last accepted observation for `key`.
    pub fn get_buffer_and_slot(&self, key: &Pubkey) -> Option<RawObservation> {
        self.0
            .accounts
            .get(key)
            .and_then(|watched| watched.buffer.clone())
    }

    /// Highest context slot seen in any batched response.
    pub fn most_recent_slot(&self) -> Slot {
        self.0.most_recent_slot.load(Ordering::Acquire)
    }

    /// Reads one account directly, bypassing the batch.
    pub async fn fetch_account(&self, key: &Pubkey) -> SyncResult<RawObservation> {
        Ok(self.0.rpc.get_account(key, self.0.commitment).await?)
    }

    pub fn is_polling(&self) -> bool {
        lock(&self.0.poller)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Runs one batched read cycle over every watched key.
    ///
    /// A call made while another cycle is in flight returns immediately.
    pub async fn load(&self) {
        if self.0.loading.swap(true, Ordering::AcqRel) {
            tracing::trace!("Load already in progress, skipping");
            return;
        }
        let _guard = LoadingGuard(&self.0.loading);

        let keys = self.watched_keys();
        if keys.is_empty() {
            return;
        }
        let chunks: Vec<Vec<Pubkey>> = keys
            .chunks(self.0.chunk_size)
            .map(<[Pubkey]>::to_vec)
            .collect();
        tracing::debug!(keys = keys.len(), chunks = chunks.len(), "Loading accounts");

        let rpc = &self.0.rpc;
        let commitment = self.0.commitment;
        let mut reads = stream::iter(chunks)
            .map(|chunk| async move {
                let result = rpc.get_multiple_accounts(&chunk, commitment).await;
                (chunk, result)
            })
            .buffer_unordered(self.0.max_concurrent_chunks);

        while let Some((chunk, result)) = reads.next().await {
            match result {
                Ok(response) => self.apply_chunk(chunk, response),
                Err(e) => self.report_chunk_error(chunk, e),
            }
        }
    }

    fn apply_chunk(&self, chunk: Vec<Pubkey>, response: MultipleAccounts) {
        if response.accounts.len() != chunk.len() {
            let reason = format!(
                "requested {} accounts, received {}",
                chunk.len(),
                response.accounts.len()
            );
            self.report_chunk_error(chunk, TransportError::InvalidResponse(reason));
            return;
        }
        self.0
            .most_recent_slot
            .fetch_max(response.slot, Ordering::AcqRel);

        let mut pending = Vec::new();
        for (key, data) in chunk.into_iter().zip(response.accounts) {
            let observation = RawObservation::new(data, response.slot);
            // Keys removed while the read was in flight are skipped.
            let Some(mut watched) = self.0.accounts.get_mut(&key) else {
                continue;
            };
            if replace_if_newer(&mut watched.buffer, &observation) {
                let callbacks: Vec<LoaderCallback> = watched.callbacks.values().cloned().collect();
                pending.push((observation, callbacks));
            }
        }

        // Invoked after every map guard is released so callbacks may add or remove keys.
        for (observation, callbacks) in pending {
            for callback in callbacks {
                callback(&observation);
            }
        }
    }

    fn report_chunk_error(&self, keys: Vec<Pubkey>, error: TransportError) {
        tracing::warn!(keys = keys.len(), "Batched account read failed: {}", error);
        let error = LoaderError {
            keys,
            source: Arc::new(error),
        };
        let callbacks: Vec<ErrorCallback> = self
            .0
            .error_callbacks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for callback in callbacks {
            callback(&error);
        }
    }

    /// Starts the background polling loop. No-op while it is already running.
    pub fn start_polling(&self) {
        let mut poller = lock(&self.0.poller);
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let inner = Arc::downgrade(&self.0);
        *poller = Some(TaskHandle::spawn(move |token| poll(inner, token)));
        tracing::info!("Bulk loader polling started");
    }

    pub fn stop_polling(&self) {
        if lock(&self.0.poller).take().is_some() {
            tracing::info!("Bulk loader polling stopped");
        }
    }

    /// Changes the polling interval, restarting the loop if it is running.
    pub fn update_polling_frequency(&self, frequency: Duration) {
        *lock(&self.0.polling_frequency) = frequency;
        if self.is_polling() {
            self.stop_polling();
            self.start_polling();
        }
    }

    pub fn polling_frequency(&self) -> Duration {
        *lock(&self.0.polling_frequency)
    }
}

/// The polling task only holds a weak reference so dropping every loader handle
/// ends it.
async fn poll(inner: Weak<LoaderInner>, token: CancellationToken) {
    loop {
        let frequency = match inner.upgrade() {
            Some(loader) => BulkAccountLoader(loader).polling_frequency(),
            None => return,
        };
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(frequency) => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let loader = BulkAccountLoader(inner);
        tokio::select! {
            _ = token.cancelled() => return,
            _ = loader.load() => {}
        }
    }
}
