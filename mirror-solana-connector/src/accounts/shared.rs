//! State shared by every single-account subscriber strategy.
//!
//! The core owns the subscription state machine, the raw-observation cache used
//! for dedup, the decoded value and the consumer callback. Deliveries carry the
//! generation they were issued under; `unsubscribe` bumps the generation while
//! holding the delivery gate, so once it returns no stale delivery can reach the
//! callback.

use super::{AccountEvent, OnChange, SubscriptionState};
use crate::{
    decode::SharedDecoder,
    error::{SyncError, SyncResult},
    observation::{RawObservation, VersionedValue},
    observer::{Listener, ListenerId, Listeners},
    util::lock,
};
use solana_sdk::pubkey::Pubkey;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// What happened to one delivered observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Accepted,
    Duplicate,
    DecodeFailed,
    Cancelled,
}

struct Gate<T> {
    generation: u64,
    live: bool,
    on_change: Option<OnChange<T>>,
}

struct CoreState<T> {
    phase: SubscriptionState,
    raw: Option<RawObservation>,
    value: Option<VersionedValue<T>>,
}

pub(crate) struct SubscriberCore<T> {
    key: Pubkey,
    decoder: SharedDecoder<T>,
    gate: Mutex<Gate<T>>,
    state: Mutex<CoreState<T>>,
    listeners: Listeners<AccountEvent>,
    activity: Notify,
}

impl<T> SubscriberCore<T> {
    pub(crate) fn key(&self) -> &Pubkey {
        &self.key
    }
}

impl<T> SubscriberCore<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(key: Pubkey, decoder: SharedDecoder<T>) -> Arc<Self> {
        Arc::new(Self {
            key,
            decoder,
            gate: Mutex::new(Gate {
                generation: 0,
                live: false,
                on_change: None,
            }),
            state: Mutex::new(CoreState {
                phase: SubscriptionState::Idle,
                raw: None,
                value: None,
            }),
            listeners: Listeners::new(),
            activity: Notify::new(),
        })
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        lock(&self.state).phase
    }

    pub(crate) fn current(&self) -> Option<VersionedValue<T>> {
        lock(&self.state).value.clone()
    }

    pub(crate) fn raw(&self) -> Option<RawObservation> {
        lock(&self.state).raw.clone()
    }

    pub(crate) fn has_observation(&self) -> bool {
        lock(&self.state).raw.is_some()
    }

    pub(crate) fn assert_active(&self) -> SyncResult<()> {
        match self.state() {
            SubscriptionState::Active => Ok(()),
            _ => Err(SyncError::NotSubscribed),
        }
    }

    pub(crate) fn add_listener(&self, listener: Listener<AccountEvent>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Resolves once any notification has been delivered since the last call.
    pub(crate) async fn activity(&self) {
        self.activity.notified().await
    }

    /// Moves `Idle -> Subscribing` and returns the generation deliveries must carry.
    ///
    /// Returns `None` when a subscription is already in progress, active, or being
    /// torn down.
    pub(crate) fn begin_subscribe(&self, on_change: OnChange<T>) -> Option<u64> {
        let mut gate = lock(&self.gate);
        let mut state = lock(&self.state);
        if state.phase != SubscriptionState::Idle {
            return None;
        }
        state.phase = SubscriptionState::Subscribing;
        gate.generation += 1;
        gate.live = true;
        gate.on_change = Some(on_change);
        Some(gate.generation)
    }

    /// Reverts a subscribe whose setup failed. No-op if `generation` is no longer current.
    pub(crate) fn abort_subscribe(&self, generation: u64) {
        let mut gate = lock(&self.gate);
        if gate.generation != generation {
            return;
        }
        gate.generation += 1;
        gate.live = false;
        gate.on_change = None;
        lock(&self.state).phase = SubscriptionState::Idle;
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        let gate = lock(&self.gate);
        gate.live && gate.generation == generation
    }

    /// Records that the live transport is being torn down and reopened.
    /// The last known value stays readable throughout.
    pub(crate) fn begin_resubscribe(&self, generation: u64) -> bool {
        let gate = lock(&self.gate);
        if !gate.live || gate.generation != generation {
            return false;
        }
        let mut state = lock(&self.state);
        // Active -> Unsubscribing -> Idle -> Subscribing, with options preserved.
        state.phase = SubscriptionState::Subscribing;
        true
    }

    /// First half of `unsubscribe`: revokes the callback and invalidates every
    /// in-flight delivery. Returns `false` if nothing was subscribed.
    pub(crate) fn begin_unsubscribe(&self) -> bool {
        let mut gate = lock(&self.gate);
        let mut state = lock(&self.state);
        let was_live = gate.live;
        gate.generation += 1;
        gate.live = false;
        gate.on_change = None;
        if state.phase != SubscriptionState::Idle {
            state.phase = SubscriptionState::Unsubscribing;
        }
        was_live
    }

    /// Second half of `unsubscribe`, once the transport has been released.
    pub(crate) fn finish_unsubscribe(&self) {
        let gate = lock(&self.gate);
        if !gate.live {
            lock(&self.state).phase = SubscriptionState::Idle;
        }
    }

    /// Delivers one observation from the live transport issued under `generation`.
    pub(crate) fn ingest(&self, generation: u64, observation: RawObservation) -> Delivery {
        let gate = lock(&self.gate);
        if !gate.live || gate.generation != generation {
            return Delivery::Cancelled;
        }
        self.activity.notify_one();
        self.deliver(&gate, observation)
    }

    /// Applies a one-off read. Outside a subscription the cache is updated without
    /// invoking any callback.
    pub(crate) fn apply_fetched(&self, observation: RawObservation) -> Delivery {
        let gate = lock(&self.gate);
        self.deliver(&gate, observation)
    }

    /// Reports a failure to listeners unless `generation` has been cancelled.
    pub(crate) fn report_error(&self, generation: u64, error: SyncError) {
        let gate = lock(&self.gate);
        if !gate.live || gate.generation != generation {
            return;
        }
        self.listeners.emit(&AccountEvent::Error {
            key: self.key,
            error: Arc::new(error),
        });
    }

    /// Gives up on the subscription after the transport could not be restored.
    /// The cached value stays readable; the caller may subscribe again.
    pub(crate) fn abandon(&self, generation: u64, error: SyncError) {
        let mut gate = lock(&self.gate);
        if !gate.live || gate.generation != generation {
            return;
        }
        tracing::error!(key = %self.key, "Giving up on subscription: {}", error);
        self.listeners.emit(&AccountEvent::Error {
            key: self.key,
            error: Arc::new(error),
        });
        gate.generation += 1;
        gate.live = false;
        gate.on_change = None;
        lock(&self.state).phase = SubscriptionState::Idle;
    }

    fn deliver(&self, gate: &Gate<T>, observation: RawObservation) -> Delivery {
        let slot = observation.slot;
        let decoded = {
            let mut state = lock(&self.state);
            // Any delivery proves the transport is live, even one that dedup drops.
            if gate.live {
                state.phase = SubscriptionState::Active;
            }
            if !observation.supersedes(state.raw.as_ref()) {
                tracing::trace!(key = %self.key, slot, "Dropping duplicate or stale observation");
                return Delivery::Duplicate;
            }

            let decoded = match observation.data.as_deref() {
                Some(bytes) => match self.decoder.decode(bytes) {
                    Ok(data) => Some(VersionedValue { data, slot }),
                    Err(e) => {
                        drop(state);
                        tracing::warn!(key = %self.key, slot, "Failed to decode account: {}", e);
                        if gate.live {
                            self.listeners.emit(&AccountEvent::Error {
                                key: self.key,
                                error: Arc::new(SyncError::Decode(e)),
                            });
                        }
                        return Delivery::DecodeFailed;
                    }
                },
                None => None,
            };

            state.raw = Some(observation);
            state.value = decoded.clone();
            decoded
        };

        if !gate.live {
            return Delivery::Accepted;
        }

        if let (Some(value), Some(on_change)) = (decoded.as_ref(), gate.on_change.as_ref()) {
            on_change(&value.data);
        }
        self.listeners.emit(&AccountEvent::Updated {
            key: self.key,
            slot,
        });
        Delivery::Accepted
    }
}
