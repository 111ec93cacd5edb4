use super::{
    shared::{Delivery, SubscriberCore},
    AccountEvent, AccountSubscriber, OnChange, SubscriptionState,
};
use crate::{
    config::AccountsConfig,
    decode::SharedDecoder,
    error::{SyncError, SyncResult, TransportError},
    observation::VersionedValue,
    observer::{Listener, ListenerId},
    transport::{AccountPubsub, AccountRpc, NotificationStream},
    util::{lock, next_backoff, TaskHandle},
};
use async_trait::async_trait;
use futures::StreamExt;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// Poll the account while the push transport looks stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingFallback {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct WebSocketSubscriberOptions {
    pub commitment: CommitmentLevel,
    /// Treat the subscription as stale after this long without a notification.
    pub resub_timeout: Option<Duration>,
    /// What to do when stale: poll (if set) or resubscribe straight away.
    pub polling_fallback: Option<PollingFallback>,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff: Duration,
}

impl Default for WebSocketSubscriberOptions {
    fn default() -> Self {
        Self {
            commitment: CommitmentLevel::Confirmed,
            resub_timeout: None,
            polling_fallback: None,
            max_reconnect_attempts: 5,
            reconnect_backoff: Duration::from_millis(500),
        }
    }
}

impl WebSocketSubscriberOptions {
    pub fn from_config(config: &AccountsConfig, commitment: CommitmentLevel) -> Self {
        Self {
            commitment,
            resub_timeout: config.resub_timeout(),
            polling_fallback: config
                .polling_fallback()
                .map(|interval| PollingFallback { interval }),
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_backoff: config.reconnect_backoff(),
        }
    }
}

/// Push-based subscriber for one account.
///
/// The live transport runs in a background task that also owns the staleness
/// timer. When the timer fires the task either resubscribes, or, with a
/// [`PollingFallback`], polls the account and resubscribes only once a poll
/// reveals a change the push transport missed.
pub struct WebSocketAccountSubscriber<T> {
    core: Arc<SubscriberCore<T>>,
    rpc: Arc<dyn AccountRpc>,
    pubsub: Arc<dyn AccountPubsub>,
    options: WebSocketSubscriberOptions,
    task: Mutex<Option<TaskHandle>>,
}

impl<T> WebSocketAccountSubscriber<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        key: Pubkey,
        decoder: SharedDecoder<T>,
        rpc: Arc<dyn AccountRpc>,
        pubsub: Arc<dyn AccountPubsub>,
        options: WebSocketSubscriberOptions,
    ) -> Self {
        Self {
            core: SubscriberCore::new(key, decoder),
            rpc,
            pubsub,
            options,
            task: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &WebSocketSubscriberOptions {
        &self.options
    }

    async fn seed(&self, generation: u64) -> SyncResult<()> {
        let observation = self
            .rpc
            .get_account(self.core.key(), self.options.commitment)
            .await?;
        self.core.ingest(generation, observation);
        Ok(())
    }
}

#[async_trait]
impl<T> AccountSubscriber<T> for WebSocketAccountSubscriber<T>
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
            if let Err(e) = self.seed(generation).await {
                tracing::warn!(%key, "Initial fetch failed: {}", e);
                self.core.abort_subscribe(generation);
                return Err(e);
            }
        }

        if !self.core.is_current(generation) {
            return Err(SyncError::Cancelled);
        }
        let stream = match self
            .pubsub
            .account_subscribe(&key, self.options.commitment)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%key, "Failed to open account subscription: {}", e);
                self.core.abort_subscribe(generation);
                return Err(e.into());
            }
        };

        {
            // Checked under the task lock so a concurrent unsubscribe either
            // sees the handle or makes this check fail.
            let mut task = lock(&self.task);
            if !self.core.is_current(generation) {
                return Err(SyncError::Cancelled);
            }
            let live = LiveLoop {
                core: self.core.clone(),
                rpc: self.rpc.clone(),
                pubsub: self.pubsub.clone(),
                options: self.options.clone(),
                generation,
            };
            *task = Some(TaskHandle::spawn(move |token| live.run(stream, token)));
        }
        tracing::info!(%key, "Account subscription opened");
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
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
        self.core.finish_unsubscribe();
        if was_live {
            tracing::info!(key = %self.core.key(), "Account subscription closed");
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

enum LiveOutcome {
    Cancelled,
    Stale,
    Ended,
}

enum FallbackOutcome {
    Cancelled,
    /// The push transport delivered again; keep using it.
    Recovered,
    /// A poll found a change the push transport missed, or the transport ended.
    Reopen,
}

struct LiveLoop<T> {
    core: Arc<SubscriberCore<T>>,
    rpc: Arc<dyn AccountRpc>,
    pubsub: Arc<dyn AccountPubsub>,
    options: WebSocketSubscriberOptions,
    generation: u64,
}

impl<T> LiveLoop<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn run(self, mut stream: NotificationStream, token: CancellationToken) {
        let key = *self.core.key();
        loop {
            match self.pump(&mut stream, &token).await {
                LiveOutcome::Cancelled => return,
                LiveOutcome::Stale => {
                    let timeout = self.options.resub_timeout.unwrap_or_default();
                    tracing::warn!(%key, ?timeout, "No account notification within timeout");
                    if let Some(fallback) = self.options.polling_fallback {
                        match self.poll_until_change(&mut stream, fallback, &token).await {
                            FallbackOutcome::Cancelled => return,
                            FallbackOutcome::Recovered => continue,
                            FallbackOutcome::Reopen => {}
                        }
                    }
                }
                LiveOutcome::Ended => {
                    tracing::warn!(%key, "Account notification stream ended");
                }
            }

            if !self.core.begin_resubscribe(self.generation) {
                return;
            }
            drop(stream);
            match self.reopen(&token).await {
                Some(reopened) => stream = reopened,
                None => return,
            }
        }
    }

    async fn pump(&self, stream: &mut NotificationStream, token: &CancellationToken) -> LiveOutcome {
        let mut deadline = self.options.resub_timeout.map(|t| Instant::now() + t);
        loop {
            let stale = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => return LiveOutcome::Cancelled,
                item = stream.next() => match item {
                    Some(observation) => {
                        if self.core.ingest(self.generation, observation) == Delivery::Cancelled {
                            return LiveOutcome::Cancelled;
                        }
                        deadline = self.options.resub_timeout.map(|t| Instant::now() + t);
                    }
                    None => return LiveOutcome::Ended,
                },
                _ = stale => return LiveOutcome::Stale,
            }
        }
    }

    async fn poll_until_change(
        &self,
        stream: &mut NotificationStream,
        fallback: PollingFallback,
        token: &CancellationToken,
    ) -> FallbackOutcome {
        let key = *self.core.key();
        let mut ticker = interval(fallback.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(%key, interval = ?fallback.interval, "Falling back to polling");

        loop {
            tokio::select! {
                _ = token.cancelled() => return FallbackOutcome::Cancelled,
                item = stream.next() => match item {
                    Some(observation) => {
                        if self.core.ingest(self.generation, observation) == Delivery::Cancelled {
                            return FallbackOutcome::Cancelled;
                        }
                        tracing::info!(%key, "Push notifications resumed; polling stopped");
                        return FallbackOutcome::Recovered;
                    }
                    None => return FallbackOutcome::Reopen,
                },
                _ = ticker.tick() => {
                    let fetched = tokio::select! {
                        _ = token.cancelled() => return FallbackOutcome::Cancelled,
                        fetched = self.rpc.get_account(&key, self.options.commitment) => fetched,
                    };
                    match fetched {
                        Ok(observation) => {
                            let missed = match self.core.raw() {
                                Some(cached) => !observation.same_bytes(&cached),
                                None => true,
                            };
                            if missed {
                                tracing::info!(%key, slot = observation.slot, "Polling detected a missed change");
                                if self.core.ingest(self.generation, observation) == Delivery::Cancelled {
                                    return FallbackOutcome::Cancelled;
                                }
                                return FallbackOutcome::Reopen;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(%key, "Fallback poll failed: {}", e);
                            self.core.report_error(self.generation, e.into());
                        }
                    }
                }
            }
        }
    }

    async fn reopen(&self, token: &CancellationToken) -> Option<NotificationStream> {
        let key = *self.core.key();
        let mut delay = self.options.reconnect_backoff;
        let attempts = self.options.max_reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            let opened = tokio::select! {
                _ = token.cancelled() => return None,
                opened = self.pubsub.account_subscribe(&key, self.options.commitment) => opened,
            };
            match opened {
                Ok(stream) => {
                    tracing::info!(%key, attempt, "Account subscription reopened");
                    return Some(stream);
                }
                Err(e) => {
                    tracing::warn!(%key, attempt, "Failed to reopen account subscription: {}", e);
                    if attempt == attempts {
                        self.core.abandon(self.generation, e.into());
                        return None;
                    }
                    self.core.report_error(self.generation, e.into());
                }
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                _ = sleep(delay) => {}
            }
            delay = next_backoff(delay, MAX_RECONNECT_BACKOFF);
        }
        self.core
            .abandon(self.generation, SyncError::Transport(TransportError::Closed));
        None
    }
}
