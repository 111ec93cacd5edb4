//! # Event Pipeline
//!
//! Turns a feed of transaction logs into bounded, ordered, queryable event
//! histories. Each transaction is parsed at most once: a signature already held by
//! the transaction cache is dropped before its logs are parsed. Parsed events are
//! inserted into one [`EventList`] per event type and into the [`TxEventCache`],
//! then announced to listeners and to any [`TransactionWaiter`].
//!
//! Live delivery and [`EventSubscriber::fetch_previous_events`] share the same
//! dedup/parse/insert path.

mod cache;
mod coder;
mod fetch;
mod list;
mod parse;
pub mod providers;
mod types;

pub use cache::TxEventCache;
pub use coder::{AnchorEventCoder, DecodedEvent, EventCoder};
pub use fetch::{fetch_logs, FetchLogsResult};
pub use list::{EventList, OrderBy, OrderDir};
pub use parse::{classify, LogLine, LogParser, ProgramLog};
pub use types::{EventSource, PipelineEvent, TypedEvent};

use crate::{
    config::EventsConfig,
    error::{SyncError, SyncResult},
    observer::{Listener, ListenerId, Listeners},
    transport::{LogHistory, TransactionLogs},
    util::lock,
};
use providers::{LogProvider, LogSink, ProviderMessage};
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey, signature::Signature};
use std::{
    collections::{HashMap, HashSet},
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};
use tokio::sync::oneshot;

#[derive(Debug, Clone)]
pub struct EventSubscriberOptions {
    /// Event types to retain. `None` keeps every type.
    pub event_types: Option<HashSet<String>>,
    pub max_events_per_type: usize,
    pub max_tx: usize,
    pub order_by: OrderBy,
    pub order_dir: OrderDir,
    pub skip_failed_transactions: bool,
    pub backfill_page_size: usize,
    pub commitment: CommitmentLevel,
}

impl Default for EventSubscriberOptions {
    fn default() -> Self {
        Self::from_config(&EventsConfig::default(), CommitmentLevel::Confirmed)
    }
}

impl EventSubscriberOptions {
    pub fn from_config(config: &EventsConfig, commitment: CommitmentLevel) -> Self {
        let event_types = if config.event_types.is_empty() {
            None
        } else {
            Some(config.event_types.iter().cloned().collect())
        };
        Self {
            event_types,
            max_events_per_type: config.max_events_per_type,
            max_tx: config.max_tx,
            order_by: config.order_by,
            order_dir: config.order_dir,
            skip_failed_transactions: config.skip_failed_transactions,
            backfill_page_size: config.backfill_page_size.max(1),
            commitment,
        }
    }

    fn retains(&self, event_type: &str) -> bool {
        self.event_types
            .as_ref()
            .map_or(true, |types| types.contains(event_type))
    }
}

type Waiters<E> = HashMap<Signature, Vec<oneshot::Sender<Vec<TypedEvent<E>>>>>;

struct PipelineState<E> {
    lists: HashMap<String, EventList<E>>,
    cache: TxEventCache<E>,
    waiters: Waiters<E>,
    arrival: u64,
}

struct PipelineInner<C: EventCoder> {
    address: Pubkey,
    parser: LogParser,
    coder: Arc<C>,
    options: EventSubscriberOptions,
    history: Arc<dyn LogHistory>,
    state: Mutex<PipelineState<C::Event>>,
    listeners: Listeners<PipelineEvent<C::Event>>,
}

/// Subscribes to the logs of one program and keeps its event history.
pub struct EventSubscriber<C: EventCoder> {
    inner: Arc<PipelineInner<C>>,
    provider: Arc<dyn LogProvider>,
    subscribing: tokio::sync::Mutex<()>,
}

impl<C: EventCoder> EventSubscriber<C> {
    pub fn new(
        address: Pubkey,
        coder: Arc<C>,
        provider: Arc<dyn LogProvider>,
        history: Arc<dyn LogHistory>,
        options: EventSubscriberOptions,
    ) -> Self {
        let state = PipelineState {
            lists: HashMap::new(),
            cache: TxEventCache::new(options.max_tx),
            waiters: HashMap::new(),
            arrival: 0,
        };
        Self {
            inner: Arc::new(PipelineInner {
                address,
                parser: LogParser::new(&address),
                coder,
                options,
                history,
                state: Mutex::new(state),
                listeners: Listeners::new(),
            }),
            provider,
            subscribing: tokio::sync::Mutex::new(()),
        }
    }

    pub fn address(&self) -> &Pubkey {
        &self.inner.address
    }

    pub fn options(&self) -> &EventSubscriberOptions {
        &self.inner.options
    }

    /// Starts the log provider. Idempotent.
    pub async fn subscribe(&self) -> SyncResult<()> {
        let _subscribing = self.subscribing.lock().await;
        if self.provider.is_subscribed() {
            return Ok(());
        }
        let inner = self.inner.clone();
        let sink: LogSink = Arc::new(move |message| match message {
            ProviderMessage::Transaction(logs) => {
                inner.handle_transaction_logs(logs, EventSource::Live);
            }
            ProviderMessage::Error(e) => {
                tracing::warn!(address = %inner.address, "Log provider error: {}", e);
                inner.listeners.emit(&PipelineEvent::Error {
                    signature: None,
                    error: Arc::new(e.into()),
                });
            }
        });
        self.provider.subscribe(sink).await?;
        tracing::info!(address = %self.inner.address, "Event subscriber started");
        Ok(())
    }

    /// Stops the log provider. No listener fires for live events after this returns.
    pub async fn unsubscribe(&self) {
        let _subscribing = self.subscribing.lock().await;
        self.provider.unsubscribe().await;
    }

    pub fn is_subscribed(&self) -> bool {
        self.provider.is_subscribed()
    }

    /// Feeds one transaction through the pipeline, returning the events it added.
    ///
    /// Returns `None` when the transaction was already processed.
    pub fn handle_transaction_logs(
        &self,
        logs: TransactionLogs,
        source: EventSource,
    ) -> Option<Vec<TypedEvent<C::Event>>> {
        self.inner.handle_transaction_logs(logs, source)
    }

    /// Walks history backwards from the newest transaction, page by page, until
    /// `boundary` is reached or `page_limit` pages have been read.
    ///
    /// Returns the events added along the way.
    pub async fn fetch_previous_events(
        &self,
        boundary: Option<Signature>,
        page_limit: usize,
    ) -> SyncResult<Vec<TypedEvent<C::Event>>> {
        let page_size = self.inner.options.backfill_page_size;
        let mut before = None;
        let mut added = Vec::new();

        for page in 0..page_limit {
            let result = fetch_logs(
                self.inner.history.as_ref(),
                &self.inner.address,
                before,
                boundary,
                page_size,
                self.inner.options.commitment,
            )
            .await?;
            tracing::debug!(
                page,
                signatures = result.signature_count,
                earliest_slot = ?result.earliest_slot,
                "Backfill page fetched"
            );

            for logs in result.transactions {
                if let Some(events) = self.inner.handle_transaction_logs(logs, EventSource::Backfill) {
                    added.extend(events);
                }
            }
            if result.signature_count < page_size {
                break;
            }
            match result.earliest_tx {
                Some(earliest) => before = Some(earliest),
                None => break,
            }
        }
        Ok(added)
    }

    /// Events of one type, in list order.
    pub fn get_events(&self, event_type: &str) -> Vec<TypedEvent<C::Event>> {
        lock(&self.inner.state)
            .lists
            .get(event_type)
            .map(EventList::to_vec)
            .unwrap_or_default()
    }

    /// Events of one transaction, in parse order. Marks it recently used.
    pub fn get_events_by_tx(&self, signature: &Signature) -> Option<Vec<TypedEvent<C::Event>>> {
        lock(&self.inner.state)
            .cache
            .get(signature)
            .map(<[TypedEvent<C::Event>]>::to_vec)
    }

    pub fn event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = lock(&self.inner.state).lists.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn cached_transactions(&self) -> usize {
        lock(&self.inner.state).cache.len()
    }

    /// Number of transactions with at least one registered waiter.
    pub fn pending_transactions(&self) -> usize {
        lock(&self.inner.state).waiters.len()
    }

    /// Resolves with the events of `signature` once it has been processed, or
    /// immediately if it already has.
    pub fn await_transaction(&self, signature: Signature) -> TransactionWaiter<C::Event> {
        let mut state = lock(&self.inner.state);
        if let Some(events) = state.cache.peek(&signature) {
            return TransactionWaiter::ready(events.to_vec());
        }
        // Waiters dropped before their transaction landed.
        state.waiters.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
        let (sender, receiver) = oneshot::channel();
        state.waiters.entry(signature).or_default().push(sender);
        TransactionWaiter::pending(receiver)
    }

    pub fn add_listener(&self, listener: Listener<PipelineEvent<C::Event>>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }
}

impl<C: EventCoder> PipelineInner<C> {
    fn handle_transaction_logs(
        &self,
        logs: TransactionLogs,
        source: EventSource,
    ) -> Option<Vec<TypedEvent<C::Event>>> {
        let signature = logs.signature;
        if lock(&self.state).cache.contains(&signature) {
            tracing::trace!(%signature, "Dropping already processed transaction");
            return None;
        }

        let skip = logs.err.is_some() && self.options.skip_failed_transactions;
        let decoded: Vec<(usize, DecodedEvent<C::Event>)> = if skip {
            tracing::debug!(%signature, "Skipping failed transaction");
            Vec::new()
        } else {
            self.parser
                .parse(&logs.logs)
                .iter()
                .filter_map(|log| self.coder.decode(log))
                .enumerate()
                .filter(|(_, event)| self.options.retains(&event.event_type))
                .collect()
        };

        let (events, waiters) = {
            let mut state = lock(&self.state);
            // Another task may have processed it while we were parsing.
            if state.cache.contains(&signature) {
                return None;
            }

            let mut events = Vec::with_capacity(decoded.len());
            for (tx_event_index, decoded) in decoded {
                state.arrival += 1;
                let event = TypedEvent {
                    signature,
                    slot: logs.slot,
                    tx_event_index,
                    event_type: decoded.event_type,
                    payload: decoded.payload,
                    arrival: state.arrival,
                    source,
                };
                let (max_size, order_by, order_dir) = (
                    self.options.max_events_per_type,
                    self.options.order_by,
                    self.options.order_dir,
                );
                state
                    .lists
                    .entry(event.event_type.clone())
                    .or_insert_with(|| EventList::new(max_size, order_by, order_dir))
                    .insert(event.clone());
                events.push(event);
            }

            if let Some((evicted, _)) = state.cache.insert(signature, events.clone()) {
                tracing::trace!(signature = %evicted, "Evicted transaction from cache");
            }
            let waiters = state.waiters.remove(&signature).unwrap_or_default();
            (events, waiters)
        };

        if !events.is_empty() {
            tracing::debug!(%signature, slot = logs.slot, count = events.len(), ?source, "Inserted events");
        }
        for waiter in waiters {
            let _ = waiter.send(events.clone());
        }
        for event in &events {
            self.listeners.emit(&PipelineEvent::NewEvent(event.clone()));
        }
        Some(events)
    }
}

enum WaiterState<E> {
    Ready(Option<Vec<TypedEvent<E>>>),
    Pending(oneshot::Receiver<Vec<TypedEvent<E>>>),
}

/// Future returned by [`EventSubscriber::await_transaction`].
///
/// Fails with [`SyncError::Cancelled`] if the subscriber is dropped first.
pub struct TransactionWaiter<E> {
    state: WaiterState<E>,
}

impl<E> TransactionWaiter<E> {
    fn ready(events: Vec<TypedEvent<E>>) -> Self {
        Self {
            state: WaiterState::Ready(Some(events)),
        }
    }

    fn pending(receiver: oneshot::Receiver<Vec<TypedEvent<E>>>) -> Self {
        Self {
            state: WaiterState::Pending(receiver),
        }
    }
}

impl<E> Unpin for TransactionWaiter<E> {}

impl<E> Future for TransactionWaiter<E> {
    type Output = SyncResult<Vec<TypedEvent<E>>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            WaiterState::Ready(events) => Poll::Ready(events.take().ok_or(SyncError::Cancelled)),
            WaiterState::Pending(receiver) => Pin::new(receiver)
                .poll(cx)
                .map(|result| result.map_err(|_| SyncError::Cancelled)),
        }
    }
}
