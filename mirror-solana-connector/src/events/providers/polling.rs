use super::{LogProvider, LogSink, ProviderMessage};
use crate::{
    config::PollingLogConfig,
    error::{SyncResult, TransportError},
    events::fetch::fetch_logs,
    transport::{LogHistory, TransactionLogs},
    util::{lock, TaskHandle},
};
use async_trait::async_trait;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey, signature::Signature};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingLogOptions {
    pub frequency: Duration,
    /// Signatures requested per history page.
    pub batch_size: usize,
}

impl Default for PollingLogOptions {
    fn default() -> Self {
        Self::from(&PollingLogConfig::default())
    }
}

impl From<&PollingLogConfig> for PollingLogOptions {
    fn from(config: &PollingLogConfig) -> Self {
        Self {
            frequency: Duration::from_millis(config.frequency_ms),
            batch_size: config.batch_size.max(1),
        }
    }
}

/// Cursor over the history of one address that only yields transactions newer
/// than the last one it returned.
pub(super) struct LogPoller {
    history: Arc<dyn LogHistory>,
    address: Pubkey,
    commitment: CommitmentLevel,
    batch_size: usize,
    last_seen: Option<Signature>,
}

impl LogPoller {
    pub(super) fn new(
        history: Arc<dyn LogHistory>,
        address: Pubkey,
        commitment: CommitmentLevel,
        batch_size: usize,
        last_seen: Option<Signature>,
    ) -> Self {
        Self {
            history,
            address,
            commitment,
            batch_size: batch_size.max(1),
            last_seen,
        }
    }

    /// New transactions since the previous poll, oldest first.
    ///
    /// The first poll without a cursor returns the latest page only.
    pub(super) async fn poll_once(&mut self) -> Result<Vec<TransactionLogs>, TransportError> {
        let until = self.last_seen;
        let mut before = None;
        let mut newest = None;
        let mut pages = Vec::new();

        loop {
            let page = fetch_logs(
                self.history.as_ref(),
                &self.address,
                before,
                until,
                self.batch_size,
                self.commitment,
            )
            .await?;
            if newest.is_none() {
                newest = page.most_recent_tx;
            }
            let full = page.signature_count >= self.batch_size;
            before = page.earliest_tx;
            pages.push(page.transactions);
            if until.is_none() || !full || before.is_none() {
                break;
            }
        }

        if newest.is_some() {
            self.last_seen = newest;
        }
        Ok(pages.into_iter().rev().flatten().collect())
    }
}

pub(super) async fn run_polling(
    mut poller: LogPoller,
    frequency: Duration,
    sink: LogSink,
    token: CancellationToken,
) {
    let mut ticker = interval(frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let polled = tokio::select! {
            _ = token.cancelled() => return,
            polled = poller.poll_once() => polled,
        };
        match polled {
            Ok(transactions) => {
                if !transactions.is_empty() {
                    tracing::debug!(count = transactions.len(), "Polled new transactions");
                }
                for logs in transactions {
                    sink(ProviderMessage::Transaction(logs));
                }
            }
            Err(e) => {
                tracing::warn!("Failed to poll transaction logs: {}", e);
                sink(ProviderMessage::Error(e));
            }
        }
    }
}

/// Polls the signature history of an address at a fixed frequency.
pub struct PollingLogProvider {
    address: Pubkey,
    commitment: CommitmentLevel,
    history: Arc<dyn LogHistory>,
    options: PollingLogOptions,
    task: Mutex<Option<TaskHandle>>,
}

impl PollingLogProvider {
    pub fn new(
        address: Pubkey,
        commitment: CommitmentLevel,
        history: Arc<dyn LogHistory>,
        options: PollingLogOptions,
    ) -> Self {
        Self {
            address,
            commitment,
            history,
            options,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LogProvider for PollingLogProvider {
    async fn subscribe(&self, sink: LogSink) -> SyncResult<()> {
        let mut task = lock(&self.task);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }
        let poller = LogPoller::new(
            self.history.clone(),
            self.address,
            self.commitment,
            self.options.batch_size,
            None,
        );
        let frequency = self.options.frequency;
        *task = Some(TaskHandle::spawn(move |token| {
            run_polling(poller, frequency, sink, token)
        }));
        tracing::info!(address = %self.address, ?frequency, "Log polling started");
        Ok(())
    }

    async fn unsubscribe(&self) {
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.shutdown().await;
            tracing::info!(address = %self.address, "Log polling stopped");
        }
    }

    fn is_subscribed(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}
