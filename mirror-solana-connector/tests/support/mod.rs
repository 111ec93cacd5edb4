//! In-memory transport doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use mirror_solana_connector::{
    decode::SharedDecoder,
    events::{DecodedEvent, EventCoder, ProgramLog},
    transport::{
        AccountPubsub, AccountRpc, FilterRequest, LogHistory, LogPubsub, LogStream,
        MultipleAccounts, NotificationStream, SessionRequest, SignatureInfo, StreamFrame,
        StreamSession, StreamTransport, TransactionLogs,
    },
    DecodeError, RawObservation, TransportError,
};
use mirror_solana_logger::LogConfig;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey, signature::Signature};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, Once,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let config = LogConfig {
            level: "debug".to_string(),
            ..LogConfig::default()
        };
        let _ = mirror_solana_logger::init(&config);
    });
}

pub fn encode(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decodes little-endian `u64` values; anything else is a decode failure.
pub fn u64_decoder() -> SharedDecoder<u64> {
    Arc::new(|data: &[u8]| -> Result<u64, DecodeError> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| DecodeError::Invalid {
            account_type: "u64".to_string(),
            reason: format!("expected 8 bytes, got {}", data.len()),
        })?;
        Ok(u64::from_le_bytes(bytes))
    })
}

/// Records every value handed to an `on_change` callback.
#[derive(Clone, Default)]
pub struct Recorder<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Recorder<T> {
    pub fn callback(&self) -> Arc<dyn Fn(&T) + Send + Sync> {
        let values = self.values.clone();
        Arc::new(move |value: &T| values.lock().unwrap().push(value.clone()))
    }

    pub fn values(&self) -> Vec<T> {
        self.values.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }
}

pub fn signature(n: u8) -> Signature {
    Signature::from([n; 64])
}

pub fn key(n: u8) -> Pubkey {
    Pubkey::new_from_array([n; 32])
}

// --- Account reads and log history ---

#[derive(Default)]
struct RpcState {
    accounts: HashMap<Pubkey, RawObservation>,
    batch_sizes: Vec<usize>,
    failing_key: Option<Pubkey>,
    fail_get_account: bool,
    get_delay: Option<Duration>,
    batch_delay: Option<Duration>,
    /// Chronological: oldest first.
    history: Vec<(SignatureInfo, Option<TransactionLogs>)>,
}

#[derive(Default)]
pub struct MockRpc {
    state: Mutex<RpcState>,
    pub get_account_calls: AtomicUsize,
    pub multiple_calls: AtomicUsize,
    pub transaction_calls: AtomicUsize,
}

impl MockRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_account(&self, key: Pubkey, value: Option<u64>, slot: u64) {
        self.set_raw(key, RawObservation::new(value.map(encode), slot));
    }

    pub fn set_raw(&self, key: Pubkey, observation: RawObservation) {
        self.state.lock().unwrap().accounts.insert(key, observation);
    }

    pub fn fail_get_account(&self, fail: bool) {
        self.state.lock().unwrap().fail_get_account = fail;
    }

    /// Fails every batched read whose chunk contains `key`.
    pub fn fail_chunk_containing(&self, key: Option<Pubkey>) {
        self.state.lock().unwrap().failing_key = key;
    }

    pub fn delay_get_account(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().get_delay = delay;
    }

    pub fn delay_batches(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().batch_delay = delay;
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().batch_sizes.clone()
    }

    pub fn get_account_calls(&self) -> usize {
        self.get_account_calls.load(Ordering::SeqCst)
    }

    pub fn multiple_calls(&self) -> usize {
        self.multiple_calls.load(Ordering::SeqCst)
    }

    /// Appends a transaction to the history, newest last.
    pub fn push_transaction(&self, logs: TransactionLogs) {
        let info = SignatureInfo {
            signature: logs.signature,
            slot: logs.slot,
            err: logs.err.clone(),
        };
        self.state.lock().unwrap().history.push((info, Some(logs)));
    }

    /// Appends a signature whose logs the node no longer has.
    pub fn push_pruned(&self, signature: Signature, slot: u64) {
        let info = SignatureInfo {
            signature,
            slot,
            err: None,
        };
        self.state.lock().unwrap().history.push((info, None));
    }
}

#[async_trait]
impl AccountRpc for MockRpc {
    async fn get_account(
        &self,
        key: &Pubkey,
        _commitment: CommitmentLevel,
    ) -> Result<RawObservation, TransportError> {
        self.get_account_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().get_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        if state.fail_get_account {
            return Err(TransportError::Other("get_account failed".to_string()));
        }
        Ok(state
            .accounts
            .get(key)
            .cloned()
            .unwrap_or_else(|| RawObservation::absent(0)))
    }

    async fn get_multiple_accounts(
        &self,
        keys: &[Pubkey],
        _commitment: CommitmentLevel,
    ) -> Result<MultipleAccounts, TransportError> {
        self.multiple_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.state.lock().unwrap().batch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.batch_sizes.push(keys.len());
        if let Some(failing) = state.failing_key {
            if keys.contains(&failing) {
                return Err(TransportError::Other("chunk failed".to_string()));
            }
        }
        let slot = state
            .accounts
            .values()
            .map(|observation| observation.slot)
            .max()
            .unwrap_or(0);
        let accounts = keys
            .iter()
            .map(|key| state.accounts.get(key).and_then(|o| o.data.clone()))
            .collect();
        Ok(MultipleAccounts { slot, accounts })
    }
}

#[async_trait]
impl LogHistory for MockRpc {
    async fn get_signatures(
        &self,
        _address: &Pubkey,
        before: Option<Signature>,
        until: Option<Signature>,
        limit: usize,
        _commitment: CommitmentLevel,
    ) -> Result<Vec<SignatureInfo>, TransportError> {
        let state = self.state.lock().unwrap();
        let newest_first = state.history.iter().rev().map(|(info, _)| info);
        let mut started = before.is_none();
        let mut page = Vec::new();
        for info in newest_first {
            if !started {
                started = Some(info.signature) == before;
                continue;
            }
            if Some(info.signature) == until || page.len() == limit {
                break;
            }
            page.push(info.clone());
        }
        Ok(page)
    }

    async fn get_transaction_logs(
        &self,
        signature: &Signature,
        _commitment: CommitmentLevel,
    ) -> Result<Option<TransactionLogs>, TransportError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state
            .history
            .iter()
            .find(|(info, _)| info.signature == *signature)
            .and_then(|(_, logs)| logs.clone()))
    }
}

// --- Push subscriptions ---

#[derive(Default)]
struct PubsubState {
    accounts: HashMap<Pubkey, Vec<mpsc::UnboundedSender<RawObservation>>>,
    logs: Vec<mpsc::UnboundedSender<TransactionLogs>>,
    failures_left: usize,
    subscribe_calls: usize,
}

#[derive(Default)]
pub struct MockPubsub {
    state: Mutex<PubsubState>,
}

impl MockPubsub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sends a notification on every open subscription for `key`.
    pub fn push(&self, key: &Pubkey, value: Option<u64>, slot: u64) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.accounts.get(key) {
            for sender in senders {
                let _ = sender.send(RawObservation::new(value.map(encode), slot));
            }
        }
    }

    pub fn push_raw(&self, key: &Pubkey, data: Option<Vec<u8>>, slot: u64) {
        let state = self.state.lock().unwrap();
        if let Some(senders) = state.accounts.get(key) {
            for sender in senders {
                let _ = sender.send(RawObservation::new(data.clone(), slot));
            }
        }
    }

    pub fn push_logs(&self, logs: TransactionLogs) {
        let state = self.state.lock().unwrap();
        for sender in &state.logs {
            let _ = sender.send(logs.clone());
        }
    }

    /// Ends every open stream, as if the server dropped them.
    pub fn drop_streams(&self) {
        let mut state = self.state.lock().unwrap();
        state.accounts.clear();
        state.logs.clear();
    }

    pub fn fail_next_subscribes(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().unwrap().subscribe_calls
    }

    pub fn open_account_streams(&self, key: &Pubkey) -> usize {
        self.state
            .lock()
            .unwrap()
            .accounts
            .get(key)
            .map_or(0, |senders| senders.iter().filter(|s| !s.is_closed()).count())
    }

    fn check_failure(state: &mut PubsubState) -> Result<(), TransportError> {
        state.subscribe_calls += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TransportError::Other("subscribe failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountPubsub for MockPubsub {
    async fn account_subscribe(
        &self,
        key: &Pubkey,
        _commitment: CommitmentLevel,
    ) -> Result<NotificationStream, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.accounts.entry(*key).or_default().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl LogPubsub for MockPubsub {
    async fn logs_subscribe(
        &self,
        _address: &Pubkey,
        _commitment: CommitmentLevel,
    ) -> Result<LogStream, TransportError> {
        let mut state = self.state.lock().unwrap();
        Self::check_failure(&mut state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.logs.push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

// --- Multiplexed stream ---

struct OpenSession {
    frames: mpsc::UnboundedSender<Result<StreamFrame, TransportError>>,
    requests: mpsc::Receiver<SessionRequest>,
}

#[derive(Default)]
struct StreamState {
    sessions: Vec<OpenSession>,
    opens: Vec<FilterRequest>,
    failures_left: usize,
}

#[derive(Default)]
pub struct MockStreamTransport {
    state: Mutex<StreamState>,
}

impl MockStreamTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Filters the sessions were opened with, in order.
    pub fn opens(&self) -> Vec<FilterRequest> {
        self.state.lock().unwrap().opens.clone()
    }

    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().unwrap().failures_left = count;
    }

    pub fn send(&self, frame: StreamFrame) {
        let state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.last() {
            let _ = session.frames.send(Ok(frame));
        }
    }

    pub fn send_account(&self, key: &Pubkey, value: u64, slot: u64) {
        self.send(StreamFrame::Account {
            key: *key,
            slot,
            data: encode(value),
        });
    }

    pub fn fail_session(&self) {
        let state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.last() {
            let _ = session
                .frames
                .send(Err(TransportError::Other("stream reset".to_string())));
        }
    }

    /// Requests written to the latest session so far.
    pub fn drain_requests(&self) -> Vec<SessionRequest> {
        let mut state = self.state.lock().unwrap();
        let mut out = Vec::new();
        if let Some(session) = state.sessions.last_mut() {
            while let Ok(request) = session.requests.try_recv() {
                out.push(request);
            }
        }
        out
    }
}

#[async_trait]
impl StreamTransport for MockStreamTransport {
    async fn open(&self, initial: FilterRequest) -> Result<StreamSession, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.opens.push(initial);
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(TransportError::Other("open failed".to_string()));
        }
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::channel(64);
        state.sessions.push(OpenSession {
            frames: frames_tx,
            requests: requests_rx,
        });
        Ok(StreamSession {
            requests: requests_tx,
            frames: UnboundedReceiverStream::new(frames_rx).boxed(),
        })
    }
}

// --- Event coding ---

/// Decodes `Program log: <Type> <payload>` lines into `(type, payload)` events.
pub struct MessageCoder;

impl EventCoder for MessageCoder {
    type Event = String;

    fn decode(&self, log: &ProgramLog) -> Option<DecodedEvent<String>> {
        let ProgramLog::Message(message) = log else {
            return None;
        };
        let (event_type, payload) = message.split_once(' ').unwrap_or((message.as_str(), ""));
        Some(DecodedEvent {
            event_type: event_type.to_string(),
            payload: payload.to_string(),
        })
    }
}

pub fn program() -> Pubkey {
    key(200)
}

/// Logs of a successful top-level call to [`program`] emitting `messages`.
pub fn program_logs(sig: Signature, slot: u64, messages: &[&str]) -> TransactionLogs {
    let program = program().to_string();
    let mut logs = vec![format!("Program {} invoke [1]", program)];
    logs.extend(messages.iter().map(|m| format!("Program log: {}", m)));
    logs.push(format!("Program {} success", program));
    TransactionLogs {
        signature: sig,
        slot,
        err: None,
        logs,
    }
}
