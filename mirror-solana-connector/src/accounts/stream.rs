use super::{
    shared::SubscriberCore, AccountEvent, AccountSubscriber, OnChange, SubscriptionState,
};
use crate::{
    config::AccountsConfig,
    decode::SharedDecoder,
    error::{SyncError, SyncResult},
    multiplexer::{HandlerId, MultiplexedSubscriber, StreamHandler},
    observation::{RawObservation, VersionedValue},
    observer::{Listener, ListenerId},
    transport::AccountRpc,
    util::{lock, TaskHandle},
};
use async_trait::async_trait;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct StreamSubscriberOptions {
    /// Commitment of the seeding reads.
    pub commitment: CommitmentLevel,
    /// Re-register the key when no update arrives for this long.
    pub resub_timeout: Option<Duration>,
}

impl Default for StreamSubscriberOptions {
    fn default() -> Self {
        Self {
            commitment: CommitmentLevel::Confirmed,
            resub_timeout: None,
        }
    }
}

impl StreamSubscriberOptions {
    pub fn from_config(config: &AccountsConfig, commitment: CommitmentLevel) -> Self {
        Self {
            commitment,
            resub_timeout: config.resub_timeout(),
        }
    }
}

/// Subscriber that joins a shared [`MultiplexedSubscriber`] instead of opening
/// its own connection.
///
/// A staleness timeout does not reopen the session (other keys share it); the
/// key is removed from the filter and added again, and one read re-seeds it.
pub struct StreamAccountSubscriber<T> {
    core: Arc<SubscriberCore<T>>,
    rpc: Arc<dyn AccountRpc>,
    multiplexer: MultiplexedSubscriber,
    options: StreamSubscriberOptions,
    registration: Arc<Mutex<Option<HandlerId>>>,
    watchdog: Mutex<Option<TaskHandle>>,
}

impl<T> StreamAccountSubscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: Pubkey,
        decoder: SharedDecoder<T>,
        rpc: Arc<dyn AccountRpc>,
        multiplexer: MultiplexedSubscriber,
        options: StreamSubscriberOptions,
    ) -> Self {
        Self {
            core: SubscriberCore::new(key, decoder),
            rpc,
            multiplexer,
            options,
            registration: Arc::new(Mutex::new(None)),
            watchdog: Mutex::new(None),
        }
    }

    pub fn multiplexer(&self) -> &MultiplexedSubscriber {
        &self.multiplexer
    }
}

impl<T> StreamAccountSubscriber<T> {
    fn release(&self) {
        if let Some(id) = lock(&self.registration).take() {
            self.multiplexer.unwatch(self.core.key(), id);
        }
    }

    /// Drops `id` only if it is still the live registration.
    fn release_own(&self, id: HandlerId) {
        let mut registration = lock(&self.registration);
        if *registration == Some(id) {
            registration.take();
            self.multiplexer.unwatch(self.core.key(), id);
        }
    }
}

#[async_trait]
impl<T> AccountSubscriber<T> for StreamAccountSubscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn key(&self) -> &Pubkey {
        self.core.key()
    }

    async fn subscribe(&self, on_change: OnChange<T>) -> SyncResult<()> {
        let Some(generation) = self.core.begin_subscribe(on_change) else {
            return Ok(());
        };
        let key = *self.core.key();

        if !self.core.has_observation() {
            match self.rpc.get_account(&key, self.options.commitment).await {
                Ok(observation) => {
                    self.core.ingest(generation, observation);
                }
                Err(e) => {
                    tracing::warn!(%key, "Initial fetch failed: {}", e);
                    self.core.abort_subscribe(generation);
                    return Err(e.into());
                }
            }
        }

        if !self.core.is_current(generation) {
            return Err(SyncError::Cancelled);
        }

        let core = self.core.clone();
        let handler: StreamHandler = Arc::new(move |observation: &RawObservation| {
            core.ingest(generation, observation.clone());
        });
        let id = self.multiplexer.watch(key, handler.clone());
        if let Some(previous) = lock(&self.registration).replace(id) {
            self.multiplexer.unwatch(&key, previous);
        }

        if let Err(e) = self.multiplexer.ensure_open().await {
            self.release_own(id);
            self.core.abort_subscribe(generation);
            return Err(e);
        }

        {
            let mut slot = lock(&self.watchdog);
            if !self.core.is_current(generation) {
                drop(slot);
                self.release_own(id);
                return Err(SyncError::Cancelled);
            }
            if let Some(timeout) = self.options.resub_timeout {
                let watchdog = Watchdog {
                    core: self.core.clone(),
                    rpc: self.rpc.clone(),
                    multiplexer: self.multiplexer.clone(),
                    registration: self.registration.clone(),
                    handler,
                    commitment: self.options.commitment,
                    timeout,
                    generation,
                };
                *slot = Some(TaskHandle::spawn(move |token| watchdog.run(token)));
            }
        }
        tracing::info!(%key, "Joined stream session");
        Ok(())
    }

    async fn fetch(&self) -> SyncResult<()> {
        let observation = self
            .rpc
            .get_account(self.core.key(), self.options.commitment)
            .await?;
        self.core.apply_fetched(observation);
        Ok(())
    }

    async fn unsubscribe(&self) {
        let was_live = self.core.begin_unsubscribe();
        let watchdog = lock(&self.watchdog).take();
        if let Some(watchdog) = watchdog {
            watchdog.shutdown().await;
        }
        self.release();
        self.core.finish_unsubscribe();
        if was_live {
            tracing::info!(key = %self.core.key(), "Left stream session");
        }
    }

    fn current(&self) -> Option<VersionedValue<T>> {
        self.core.current()
    }

    fn assert_active(&self) -> SyncResult<()> {
        self.core.assert_active()
    }

    fn state(&self) -> SubscriptionState {
        self.core.state()
    }

    fn add_listener(&self, listener: Listener<AccountEvent>) -> ListenerId {
        self.core.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.core.remove_listener(id)
    }
}

impl<T> Drop for StreamAccountSubscriber<T> {
    fn drop(&mut self) {
        self.release();
    }
}

struct Watchdog<T> {
    core: Arc<SubscriberCore<T>>,
    rpc: Arc<dyn AccountRpc>,
    multiplexer: MultiplexedSubscriber,
    registration: Arc<Mutex<Option<HandlerId>>>,
    handler: StreamHandler,
    commitment: CommitmentLevel,
    timeout: Duration,
    generation: u64,
}

impl<T> Watchdog<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(self, token: CancellationToken) {
        let key = *self.core.key();
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.core.activity() => continue,
                _ = sleep(self.timeout) => {}
            }

            tracing::warn!(%key, timeout = ?self.timeout, "No stream update within timeout; re-registering key");
            self.core
                .report_error(self.generation, SyncError::Stale(self.timeout));
            if !self.core.begin_resubscribe(self.generation) {
                return;
            }

            {
                let mut registration = lock(&self.registration);
                let Some(previous) = registration.take() else {
                    return;
                };
                self.multiplexer.unwatch(&key, previous);
                *registration = Some(self.multiplexer.watch(key, self.handler.clone()));
            }

            let reopened = tokio::select! {
                _ = token.cancelled() => return,
                reopened = self.multiplexer.ensure_open() => reopened,
            };
            if let Err(e) = reopened {
                self.core.report_error(self.generation, e);
            }

            let fetched = tokio::select! {
                _ = token.cancelled() => return,
                fetched = self.rpc.get_account(&key, self.commitment) => fetched,
            };
            match fetched {
                Ok(observation) => {
                    self.core.ingest(self.generation, observation);
                }
                Err(e) => self.core.report_error(self.generation, e.into()),
            }
        }
    }
}
