//! # Multiplexed Stream Subscriber
//!
//! One stream session carrying account updates for a dynamic set of keys. Keys are
//! added and removed by rewriting the server-side filter over the open session;
//! additions are coalesced for a short debounce window while removals are flushed
//! straight away. A hard stream error marks every key stale and reopens the session
//! with the full key set, backing off exponentially between attempts.

use crate::{
    accounts::SubscriptionState,
    config::MultiplexerConfig,
    error::{SyncResult, TransportError},
    observation::{replace_if_newer, RawObservation},
    observer::{Listener, ListenerId, Listeners},
    transport::{FilterRequest, SessionRequest, StreamFrame, StreamSession, StreamTransport},
    util::{lock, next_backoff, TaskHandle},
};
use futures::StreamExt;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify},
    time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

/// Per-key handler registered with [`MultiplexedSubscriber::watch`].
pub type StreamHandler = Arc<dyn Fn(&RawObservation) + Send + Sync>;

/// Session-wide handler registered with [`MultiplexedSubscriber::subscribe`].
pub type OnAccountChange = Arc<dyn Fn(&Pubkey, &RawObservation) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Session lifecycle signals.
#[derive(Debug, Clone)]
pub enum MultiplexerEvent {
    Opened { keys: usize },
    Reopened { keys: usize, attempt: u32 },
    Error(Arc<TransportError>),
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    debounce: Duration,
    ping_interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

#[derive(Default)]
struct KeyEntry {
    handlers: HashMap<HandlerId, StreamHandler>,
    /// Added through `subscribe`/`add_keys` and routed to the session-wide handler.
    default: bool,
    last: Option<RawObservation>,
    stale: bool,
}

impl KeyEntry {
    fn is_unused(&self) -> bool {
        !self.default && self.handlers.is_empty()
    }
}

struct MuxState {
    phase: SubscriptionState,
    keys: HashMap<Pubkey, KeyEntry>,
    default_handler: Option<OnAccountChange>,
    filter_dirty: bool,
    flush_now: bool,
}

impl MuxState {
    fn take_filter(&mut self, commitment: CommitmentLevel) -> FilterRequest {
        self.filter_dirty = false;
        self.flush_now = false;
        let mut accounts: Vec<Pubkey> = self.keys.keys().copied().collect();
        accounts.sort();
        FilterRequest {
            accounts,
            commitment,
        }
    }

    fn insert_key(&mut self, key: Pubkey) -> &mut KeyEntry {
        if !self.keys.contains_key(&key) {
            self.filter_dirty = true;
        }
        self.keys.entry(key).or_default()
    }

    fn drop_if_unused(&mut self, key: &Pubkey) {
        if self.keys.get(key).is_some_and(KeyEntry::is_unused) {
            self.keys.remove(key);
            self.filter_dirty = true;
            self.flush_now = true;
        }
    }
}

struct Inner {
    transport: Arc<dyn StreamTransport>,
    commitment: CommitmentLevel,
    timing: Timing,
    state: Mutex<MuxState>,
    open_lock: tokio::sync::Mutex<()>,
    task: Mutex<Option<TaskHandle>>,
    flush: Arc<Notify>,
    next_id: AtomicU64,
    listeners: Listeners<MultiplexerEvent>,
}

/// Cheaply cloneable handle to one shared stream session.
#[derive(Clone)]
pub struct MultiplexedSubscriber(Arc<Inner>);

impl MultiplexedSubscriber {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        commitment: CommitmentLevel,
        config: &MultiplexerConfig,
    ) -> Self {
        Self(Arc::new(Inner {
            transport,
            commitment,
            timing: Timing {
                debounce: config.debounce(),
                ping_interval: config.ping_interval(),
                initial_backoff: config.initial_reconnect_backoff(),
                max_backoff: config.max_reconnect_backoff(),
            },
            state: Mutex::new(MuxState {
                phase: SubscriptionState::Idle,
                keys: HashMap::new(),
                default_handler: None,
                filter_dirty: false,
                flush_now: false,
            }),
            open_lock: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
            flush: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
            listeners: Listeners::new(),
        }))
    }

    /// Watches `keys`, routing their updates to `on_change`, and opens the session
    /// if it is not open yet.
    ///
    /// On failure the keys stay registered and a later call retries the open.
    pub async fn subscribe(&self, keys: &[Pubkey], on_change: OnAccountChange) -> SyncResult<()> {
        {
            let mut state = lock(&self.0.state);
            state.default_handler = Some(on_change);
            for key in keys {
                state.insert_key(*key).default = true;
            }
        }
        self.0.flush.notify_one();
        self.ensure_open().await
    }

    /// Adds keys routed to the session-wide handler. Coalesced into one filter update.
    pub fn add_keys(&self, keys: &[Pubkey]) {
        let changed = {
            let mut state = lock(&self.0.state);
            for key in keys {
                state.insert_key(*key).default = true;
            }
            state.filter_dirty
        };
        if changed {
            self.0.flush.notify_one();
        }
    }

    /// Removes keys added with [`Self::add_keys`]. Keys still watched by a handler stay.
    pub fn remove_keys(&self, keys: &[Pubkey]) {
        let changed = {
            let mut state = lock(&self.0.state);
            for key in keys {
                if let Some(entry) = state.keys.get_mut(key) {
                    entry.default = false;
                }
                state.drop_if_unused(key);
            }
            state.flush_now
        };
        if changed {
            self.0.flush.notify_one();
        }
    }

    /// Registers a per-key handler. The session itself is opened by [`Self::ensure_open`].
    pub fn watch(&self, key: Pubkey, handler: StreamHandler) -> HandlerId {
        let id = HandlerId(self.0.next_id.fetch_add(1, Ordering::Relaxed));
        let changed = {
            let mut state = lock(&self.0.state);
            state.insert_key(key).handlers.insert(id, handler);
            state.filter_dirty
        };
        if changed {
            self.0.flush.notify_one();
        }
        id
    }

    /// Removes a per-key handler; the key leaves the filter with its last user.
    pub fn unwatch(&self, key: &Pubkey, id: HandlerId) {
        let changed = {
            let mut state = lock(&self.0.state);
            if let Some(entry) = state.keys.get_mut(key) {
                entry.handlers.remove(&id);
            }
            state.drop_if_unused(key);
            state.flush_now
        };
        if changed {
            self.0.flush.notify_one();
        }
    }

    /// Opens the session with the current key set unless it is already running.
    pub async fn ensure_open(&self) -> SyncResult<()> {
        let _open = self.0.open_lock.lock().await;
        if lock(&self.0.task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(());
        }

        let filter = {
            let mut state = lock(&self.0.state);
            state.phase = SubscriptionState::Subscribing;
            state.take_filter(self.0.commitment)
        };
        let keys = filter.accounts.len();

        let session = match self.0.transport.open(filter).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Failed to open stream session: {}", e);
                let mut state = lock(&self.0.state);
                state.phase = SubscriptionState::Idle;
                state.filter_dirty = true;
                return Err(e.into());
            }
        };

        lock(&self.0.state).phase = SubscriptionState::Active;
        let weak = Arc::downgrade(&self.0);
        let flush = self.0.flush.clone();
        let timing = self.0.timing;
        let commitment = self.0.commitment;
        let handle = TaskHandle::spawn(move |token| {
            run_session(weak, flush, session, timing, commitment, token)
        });
        *lock(&self.0.task) = Some(handle);

        tracing::info!(keys, "Stream session opened");
        self.0.listeners.emit(&MultiplexerEvent::Opened { keys });
        Ok(())
    }

    /// Closes the session and forgets every key and handler. Idempotent.
    pub async fn unsubscribe(&self) {
        let _open = self.0.open_lock.lock().await;
        let task = lock(&self.0.task).take();
        let was_open = task.is_some();
        if let Some(task) = task {
            task.shutdown().await;
        }
        {
            let mut state = lock(&self.0.state);
            state.keys.clear();
            state.default_handler = None;
            state.filter_dirty = false;
            state.flush_now = false;
            state.phase = SubscriptionState::Idle;
        }
        if was_open {
            tracing::info!("Stream session closed");
            self.0.listeners.emit(&MultiplexerEvent::Closed);
        }
    }

    /// Whether `key` has gone without an update since the last session error.
    pub fn is_stale(&self, key: &Pubkey) -> bool {
        lock(&self.0.state)
            .keys
            .get(key)
            .is_some_and(|entry| entry.stale)
    }

    pub fn watched_keys(&self) -> Vec<Pubkey> {
        let mut keys: Vec<Pubkey> = lock(&self.0.state).keys.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn is_open(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    pub fn state(&self) -> SubscriptionState {
        lock(&self.0.state).phase
    }

    pub fn commitment(&self) -> CommitmentLevel {
        self.0.commitment
    }

    pub fn add_listener(&self, listener: Listener<MultiplexerEvent>) -> ListenerId {
        self.0.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.0.listeners.remove(id)
    }
}

impl Inner {
    fn dispatch(&self, key: Pubkey, observation: RawObservation) {
        let (handlers, default) = {
            let mut state = lock(&self.state);
            let default_handler = state.default_handler.clone();
            let Some(entry) = state.keys.get_mut(&key) else {
                tracing::trace!(%key, "Dropping update for unwatched key");
                return;
            };
            entry.stale = false;
            if !replace_if_newer(&mut entry.last, &observation) {
                tracing::trace!(%key, slot = observation.slot, "Dropping duplicate stream update");
                return;
            }
            let handlers: Vec<StreamHandler> = entry.handlers.values().cloned().collect();
            let default = if entry.default { default_handler } else { None };
            (handlers, default)
        };

        for handler in handlers {
            handler(&observation);
        }
        if let Some(default) = default {
            default(&key, &observation);
        }
    }

    /// Returns `(dirty, immediate)` for the pending filter change.
    fn pending_flush(&self) -> (bool, bool) {
        let state = lock(&self.state);
        (state.filter_dirty, state.flush_now)
    }

    async fn send_filter(&self, requests: &mpsc::Sender<SessionRequest>) -> Result<(), TransportError> {
        let filter = lock(&self.state).take_filter(self.commitment);
        tracing::debug!(keys = filter.accounts.len(), "Updating stream filter");
        send(requests, SessionRequest::Filter(filter)).await
    }

    fn mark_all_stale(&self) {
        let mut state = lock(&self.state);
        state.phase = SubscriptionState::Subscribing;
        for entry in state.keys.values_mut() {
            entry.stale = true;
        }
    }
}

async fn send(
    requests: &mpsc::Sender<SessionRequest>,
    request: SessionRequest,
) -> Result<(), TransportError> {
    requests
        .send(request)
        .await
        .map_err(|_| TransportError::Closed)
}

/// Drives one session: dispatches frames, flushes filter changes, keeps the
/// connection alive and reopens it after a hard error.
///
/// Holds only a weak reference so dropping every handle ends the task.
async fn run_session(
    weak: Weak<Inner>,
    flush: Arc<Notify>,
    mut session: StreamSession,
    timing: Timing,
    commitment: CommitmentLevel,
    token: CancellationToken,
) {
    let mut debounce_deadline: Option<Instant> = None;
    let mut ping = interval_at(Instant::now() + timing.ping_interval, timing.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_id: u32 = 0;

    loop {
        let debounce = async move {
            match debounce_deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        let failure = tokio::select! {
            _ = token.cancelled() => return,
            frame = session.frames.next() => {
                let Some(inner) = weak.upgrade() else { return };
                match frame {
                    Some(Ok(StreamFrame::Account { key, slot, data })) => {
                        inner.dispatch(key, RawObservation::new(Some(data), slot));
                        None
                    }
                    Some(Ok(StreamFrame::Ping)) => {
                        ping_id = ping_id.wrapping_add(1);
                        send(&session.requests, SessionRequest::Ping { id: ping_id }).await.err()
                    }
                    Some(Ok(StreamFrame::Pong { id })) => {
                        tracing::trace!(id, "Stream pong");
                        None
                    }
                    Some(Err(e)) => Some(e),
                    None => Some(TransportError::Closed),
                }
            }
            _ = flush.notified() => {
                let Some(inner) = weak.upgrade() else { return };
                match inner.pending_flush() {
                    (_, true) => {
                        debounce_deadline = None;
                        inner.send_filter(&session.requests).await.err()
                    }
                    (true, false) => {
                        if debounce_deadline.is_none() {
                            debounce_deadline = Some(Instant::now() + timing.debounce);
                        }
                        None
                    }
                    (false, false) => None,
                }
            }
            _ = debounce => {
                debounce_deadline = None;
                let Some(inner) = weak.upgrade() else { return };
                inner.send_filter(&session.requests).await.err()
            }
            _ = ping.tick() => {
                ping_id = ping_id.wrapping_add(1);
                send(&session.requests, SessionRequest::Ping { id: ping_id }).await.err()
            }
        };

        if let Some(error) = failure {
            match reopen(&weak, error, timing, commitment, &token).await {
                Some(reopened) => {
                    session = reopened;
                    debounce_deadline = None;
                    ping.reset();
                }
                None => return,
            }
        }
    }
}

async fn reopen(
    weak: &Weak<Inner>,
    error: TransportError,
    timing: Timing,
    commitment: CommitmentLevel,
    token: &CancellationToken,
) -> Option<StreamSession> {
    {
        let inner = weak.upgrade()?;
        tracing::warn!("Stream session failed: {}", error);
        inner.mark_all_stale();
        inner.listeners.emit(&MultiplexerEvent::Error(Arc::new(error)));
    }

    let mut delay = timing.initial_backoff;
    let mut attempt: u32 = 0;
    loop {
        attempt = attempt.saturating_add(1);
        let (transport, filter) = {
            let inner = weak.upgrade()?;
            let filter = lock(&inner.state).take_filter(commitment);
            (inner.transport.clone(), filter)
        };
        let keys = filter.accounts.len();

        let opened = tokio::select! {
            _ = token.cancelled() => return None,
            opened = transport.open(filter) => opened,
        };
        let inner = weak.upgrade()?;
        match opened {
            Ok(session) => {
                lock(&inner.state).phase = SubscriptionState::Active;
                tracing::info!(keys, attempt, "Stream session reopened");
                inner
                    .listeners
                    .emit(&MultiplexerEvent::Reopened { keys, attempt });
                return Some(session);
            }
            Err(e) => {
                tracing::warn!(attempt, ?delay, "Failed to reopen stream session: {}", e);
                inner.listeners.emit(&MultiplexerEvent::Error(Arc::new(e)));
            }
        }
        drop(inner);

        tokio::select! {
            _ = token.cancelled() => return None,
            _ = sleep(delay) => {}
        }
        delay = next_backoff(delay, timing.max_backoff);
    }
}
