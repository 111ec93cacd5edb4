use super::{
    polling::{run_polling, LogPoller, PollingLogOptions},
    LogProvider, LogSink, ProviderMessage, INITIAL_RECONNECT_BACKOFF, MAX_RECONNECT_BACKOFF,
};
use crate::{
    error::{SyncResult, TransportError},
    transport::{LogHistory, LogPubsub, LogStream},
    util::{lock, next_backoff, TaskHandle},
};
use async_trait::async_trait;
use futures::StreamExt;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey, signature::Signature};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketLogOptions {
    pub resub_timeout: Option<Duration>,
    pub max_reconnect_attempts: u32,
    /// Switch to polling once reconnect attempts are exhausted.
    pub fallback: Option<PollingLogOptions>,
}

impl Default for WebSocketLogOptions {
    fn default() -> Self {
        Self {
            resub_timeout: None,
            max_reconnect_attempts: 5,
            fallback: None,
        }
    }
}

/// Push log feed over `logsSubscribe`.
pub struct WebSocketLogProvider {
    address: Pubkey,
    commitment: CommitmentLevel,
    pubsub: Arc<dyn LogPubsub>,
    history: Option<Arc<dyn LogHistory>>,
    options: WebSocketLogOptions,
    task: Mutex<Option<TaskHandle>>,
    subscribing: tokio::sync::Mutex<()>,
}

impl WebSocketLogProvider {
    pub fn new(
        address: Pubkey,
        commitment: CommitmentLevel,
        pubsub: Arc<dyn LogPubsub>,
        history: Option<Arc<dyn LogHistory>>,
        options: WebSocketLogOptions,
    ) -> Self {
        Self {
            address,
            commitment,
            pubsub,
            history,
            options,
            task: Mutex::new(None),
            subscribing: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl LogProvider for WebSocketLogProvider {
    async fn subscribe(&self, sink: LogSink) -> SyncResult<()> {
        let _subscribing = self.subscribing.lock().await;
        if self.is_subscribed() {
            return Ok(());
        }
        let stream = self
            .pubsub
            .logs_subscribe(&self.address, self.commitment)
            .await?;

        let feed = LogFeed {
            address: self.address,
            commitment: self.commitment,
            pubsub: self.pubsub.clone(),
            history: self.history.clone(),
            options: self.options.clone(),
            sink,
        };
        *lock(&self.task) = Some(TaskHandle::spawn(move |token| feed.run(stream, token)));
        tracing::info!(address = %self.address, "Log subscription opened");
        Ok(())
    }

    async fn unsubscribe(&self) {
        let _subscribing = self.subscribing.lock().await;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.shutdown().await;
            tracing::info!(address = %self.address, "Log subscription closed");
        }
    }

    fn is_subscribed(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

enum FeedOutcome {
    Cancelled,
    Stale,
    Ended,
}

struct LogFeed {
    address: Pubkey,
    commitment: CommitmentLevel,
    pubsub: Arc<dyn LogPubsub>,
    history: Option<Arc<dyn LogHistory>>,
    options: WebSocketLogOptions,
    sink: LogSink,
}

impl LogFeed {
    async fn run(self, mut stream: LogStream, token: CancellationToken) {
        let address = self.address;
        let mut last_seen: Option<Signature> = None;

        loop {
            match self.pump(&mut stream, &mut last_seen, &token).await {
                FeedOutcome::Cancelled => return,
                FeedOutcome::Stale => {
                    tracing::warn!(%address, "No logs within timeout; resubscribing");
                }
                FeedOutcome::Ended => {
                    tracing::warn!(%address, "Log stream ended; resubscribing");
                }
            }
            drop(stream);

            match self.reconnect(&token).await {
                Reconnect::Opened(reopened) => stream = reopened,
                Reconnect::Cancelled => return,
                Reconnect::Exhausted(error) => {
                    match (self.options.fallback, self.history.clone()) {
                        (Some(fallback), Some(history)) => {
                            tracing::warn!(%address, "Log subscription lost; falling back to polling");
                            (self.sink)(ProviderMessage::Error(error));
                            let poller = LogPoller::new(
                                history,
                                address,
                                self.commitment,
                                fallback.batch_size,
                                last_seen,
                            );
                            run_polling(poller, fallback.frequency, self.sink.clone(), token).await;
                        }
                        _ => {
                            tracing::error!(%address, "Giving up on log subscription");
                            (self.sink)(ProviderMessage::Error(error));
                        }
                    }
                    return;
                }
            }
        }
    }

    async fn pump(
        &self,
        stream: &mut LogStream,
        last_seen: &mut Option<Signature>,
        token: &CancellationToken,
    ) -> FeedOutcome {
        let mut deadline = self.options.resub_timeout.map(|t| Instant::now() + t);
        loop {
            let stale = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => return FeedOutcome::Cancelled,
                item = stream.next() => match item {
                    Some(logs) => {
                        *last_seen = Some(logs.signature);
                        (self.sink)(ProviderMessage::Transaction(logs));
                        deadline = self.options.resub_timeout.map(|t| Instant::now() + t);
                    }
                    None => return FeedOutcome::Ended,
                },
                _ = stale => return FeedOutcome::Stale,
            }
        }
    }

    async fn reconnect(&self, token: &CancellationToken) -> Reconnect {
        let attempts = self.options.max_reconnect_attempts.max(1);
        let mut delay = INITIAL_RECONNECT_BACKOFF;
        let mut last_error = TransportError::Closed;
        for attempt in 1..=attempts {
            let opened = tokio::select! {
                _ = token.cancelled() => return Reconnect::Cancelled,
                opened = self.pubsub.logs_subscribe(&self.address, self.commitment) => opened,
            };
            match opened {
                Ok(stream) => {
                    tracing::info!(address = %self.address, attempt, "Log subscription reopened");
                    return Reconnect::Opened(stream);
                }
                Err(e) => {
                    tracing::warn!(address = %self.address, attempt, "Failed to reopen log subscription: {}", e);
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::select! {
                    _ = token.cancelled() => return Reconnect::Cancelled,
                    _ = sleep(delay) => {}
                }
                delay = next_backoff(delay, MAX_RECONNECT_BACKOFF);
            }
        }
        Reconnect::Exhausted(last_error)
    }
}

enum Reconnect {
    Opened(LogStream),
    Cancelled,
    Exhausted(TransportError),
}
