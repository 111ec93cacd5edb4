use super::{
    LogProvider, LogSink, ProviderMessage, INITIAL_RECONNECT_BACKOFF, MAX_RECONNECT_BACKOFF,
};
use crate::{
    error::{SyncResult, TransportError},
    transport::{RelaySource, RelayStream, TransactionLogs},
    util::{lock, next_backoff, TaskHandle},
};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Signature;
use std::{
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// One relayed transaction, as sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayMessage {
    pub signature: String,
    pub slot: u64,
    pub logs: Vec<String>,
    #[serde(default)]
    pub err: Option<serde_json::Value>,
}

impl TryFrom<RelayMessage> for TransactionLogs {
    type Error = TransportError;

    fn try_from(message: RelayMessage) -> Result<Self, Self::Error> {
        let signature = Signature::from_str(&message.signature).map_err(|e| {
            TransportError::InvalidResponse(format!(
                "invalid signature '{}': {}",
                message.signature, e
            ))
        })?;
        Ok(TransactionLogs {
            signature,
            slot: message.slot,
            err: message.err.map(|err| err.to_string()),
            logs: message.logs,
        })
    }
}

fn parse_frame(text: &str) -> Result<TransactionLogs, TransportError> {
    let message: RelayMessage = serde_json::from_str(text)
        .map_err(|e| TransportError::InvalidResponse(format!("malformed relay frame: {}", e)))?;
    message.try_into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayLogOptions {
    pub resub_timeout: Option<Duration>,
    pub max_reconnect_attempts: u32,
}

impl Default for RelayLogOptions {
    fn default() -> Self {
        Self {
            resub_timeout: None,
            max_reconnect_attempts: 5,
        }
    }
}

/// Log feed relayed by an external service as JSON text frames.
pub struct RelayLogProvider {
    source: Arc<dyn RelaySource>,
    options: RelayLogOptions,
    task: Mutex<Option<TaskHandle>>,
    subscribing: tokio::sync::Mutex<()>,
}

impl RelayLogProvider {
    pub fn new(source: Arc<dyn RelaySource>, options: RelayLogOptions) -> Self {
        Self {
            source,
            options,
            task: Mutex::new(None),
            subscribing: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl LogProvider for RelayLogProvider {
    async fn subscribe(&self, sink: LogSink) -> SyncResult<()> {
        let _subscribing = self.subscribing.lock().await;
        if self.is_subscribed() {
            return Ok(());
        }
        let frames = self.source.connect().await?;
        let feed = RelayFeed {
            source: self.source.clone(),
            options: self.options.clone(),
            sink,
        };
        *lock(&self.task) = Some(TaskHandle::spawn(move |token| feed.run(frames, token)));
        tracing::info!("Relay log feed connected");
        Ok(())
    }

    async fn unsubscribe(&self) {
        let _subscribing = self.subscribing.lock().await;
        let task = lock(&self.task).take();
        if let Some(task) = task {
            task.shutdown().await;
            tracing::info!("Relay log feed closed");
        }
    }

    fn is_subscribed(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

struct RelayFeed {
    source: Arc<dyn RelaySource>,
    options: RelayLogOptions,
    sink: LogSink,
}

impl RelayFeed {
    async fn run(self, mut frames: RelayStream, token: CancellationToken) {
        loop {
            let Some(reason) = self.pump(&mut frames, &token).await else {
                return;
            };
            tracing::warn!("Relay feed interrupted: {}", reason);
            drop(frames);

            let attempts = self.options.max_reconnect_attempts.max(1);
            let mut delay = INITIAL_RECONNECT_BACKOFF;
            let mut reopened = None;
            let mut last_error = reason;
            for attempt in 1..=attempts {
                let connected = tokio::select! {
                    _ = token.cancelled() => return,
                    connected = self.source.connect() => connected,
                };
                match connected {
                    Ok(stream) => {
                        tracing::info!(attempt, "Relay feed reconnected");
                        reopened = Some(stream);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(attempt, "Failed to reconnect to relay: {}", e);
                        last_error = e;
                    }
                }
                if attempt < attempts {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = sleep(delay) => {}
                    }
                    delay = next_backoff(delay, MAX_RECONNECT_BACKOFF);
                }
            }

            match reopened {
                Some(stream) => frames = stream,
                None => {
                    tracing::error!("Giving up on relay feed");
                    (self.sink)(ProviderMessage::Error(last_error));
                    return;
                }
            }
        }
    }

    /// Forwards frames until the feed breaks. Returns `None` when cancelled.
    async fn pump(&self, frames: &mut RelayStream, token: &CancellationToken) -> Option<TransportError> {
        let timeout = self.options.resub_timeout;
        let mut deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let stale = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = token.cancelled() => return None,
                frame = frames.next() => match frame {
                    Some(Ok(text)) => {
                        deadline = timeout.map(|t| Instant::now() + t);
                        match parse_frame(&text) {
                            Ok(logs) => (self.sink)(ProviderMessage::Transaction(logs)),
                            Err(e) => {
                                tracing::warn!("Dropping relay frame: {}", e);
                                (self.sink)(ProviderMessage::Error(e));
                            }
                        }
                    }
                    Some(Err(e)) => return Some(e),
                    None => return Some(TransportError::Closed),
                },
                _ = stale => {
                    return Some(TransportError::Other(format!(
                        "no relay frame within {:?}",
                        timeout.unwrap_or_default()
                    )));
                }
            }
        }
    }
}
