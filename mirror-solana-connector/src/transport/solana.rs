//! Transport capabilities backed by the Solana JSON-RPC and PubSub clients.

use super::{
    AccountPubsub, AccountRpc, LogHistory, LogPubsub, LogStream, MultipleAccounts,
    NotificationStream, SignatureInfo, TransactionLogs,
};
use crate::{error::TransportError, observation::RawObservation};
use async_trait::async_trait;
use futures::StreamExt;
use solana_account_decoder::UiAccountEncoding;
use solana_client::{
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_client::GetConfirmedSignaturesForAddress2Config,
    rpc_config::{
        RpcAccountInfoConfig, RpcTransactionConfig, RpcTransactionLogsConfig,
        RpcTransactionLogsFilter,
    },
};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    pubkey::Pubkey,
    signature::Signature,
};
use solana_transaction_status::UiTransactionEncoding;
use std::{str::FromStr, sync::Arc};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

const DEFAULT_FORWARD_BUFFER: usize = 256;

/// History queries reject `processed`; they are served at `confirmed` instead.
fn history_commitment(commitment: CommitmentLevel) -> CommitmentConfig {
    match commitment {
        CommitmentLevel::Processed => CommitmentConfig::confirmed(),
        other => CommitmentConfig { commitment: other },
    }
}

fn parse_signature(s: &str) -> Result<Signature, TransportError> {
    Signature::from_str(s)
        .map_err(|e| TransportError::InvalidResponse(format!("bad signature '{}': {}", s, e)))
}

/// Account and history reads over JSON-RPC.
#[derive(Clone)]
pub struct SolanaRpc {
    client: Arc<RpcClient>,
}

impl SolanaRpc {
    pub fn new(client: Arc<RpcClient>) -> Self {
        Self { client }
    }

    pub fn from_url(rpc_url: impl ToString) -> Self {
        Self::new(Arc::new(RpcClient::new(rpc_url.to_string())))
    }

    pub fn client(&self) -> &Arc<RpcClient> {
        &self.client
    }
}

#[async_trait]
impl AccountRpc for SolanaRpc {
    async fn get_account(
        &self,
        key: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<RawObservation, TransportError> {
        let response = self
            .client
            .get_account_with_commitment(key, CommitmentConfig { commitment })
            .await?;
        Ok(RawObservation::new(
            response.value.map(|account| account.data),
            response.context.slot,
        ))
    }

    async fn get_multiple_accounts(
        &self,
        keys: &[Pubkey],
        commitment: CommitmentLevel,
    ) -> Result<MultipleAccounts, TransportError> {
        let response = self
            .client
            .get_multiple_accounts_with_commitment(keys, CommitmentConfig { commitment })
            .await?;
        Ok(MultipleAccounts {
            slot: response.context.slot,
            accounts: response
                .value
                .into_iter()
                .map(|account| account.map(|a| a.data))
                .collect(),
        })
    }
}

#[async_trait]
impl LogHistory for SolanaRpc {
    async fn get_signatures(
        &self,
        address: &Pubkey,
        before: Option<Signature>,
        until: Option<Signature>,
        limit: usize,
        commitment: CommitmentLevel,
    ) -> Result<Vec<SignatureInfo>, TransportError> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before,
            until,
            limit: Some(limit),
            commitment: Some(history_commitment(commitment)),
        };
        let statuses = self
            .client
            .get_signatures_for_address_with_config(address, config)
            .await?;
        statuses
            .into_iter()
            .map(|status| {
                Ok(SignatureInfo {
                    signature: parse_signature(&status.signature)?,
                    slot: status.slot,
                    err: status.err.map(|e| format!("{:?}", e)),
                })
            })
            .collect()
    }

    async fn get_transaction_logs(
        &self,
        signature: &Signature,
        commitment: CommitmentLevel,
    ) -> Result<Option<TransactionLogs>, TransportError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(history_commitment(commitment)),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .client
            .get_transaction_with_config(signature, config)
            .await?;
        let slot = tx.slot;
        let Some(meta) = tx.transaction.meta else {
            return Ok(None);
        };
        let err = meta.err.as_ref().map(|e| format!("{:?}", e));
        let logs: Option<Vec<String>> = meta.log_messages.into();
        Ok(logs.map(|logs| TransactionLogs {
            signature: *signature,
            slot,
            err,
            logs,
        }))
    }
}

/// Push subscriptions over the PubSub websocket.
///
/// Each subscription runs in its own forwarding task that owns the client-side
/// stream; dropping the returned stream makes the task unsubscribe.
#[derive(Clone)]
pub struct SolanaPubsub {
    client: Arc<PubsubClient>,
    buffer: usize,
}

impl SolanaPubsub {
    pub async fn connect(ws_url: &str) -> Result<Self, TransportError> {
        let client = PubsubClient::new(ws_url).await?;
        tracing::info!("Connected to PubSub endpoint {}", ws_url);
        Ok(Self::new(Arc::new(client)))
    }

    pub fn new(client: Arc<PubsubClient>) -> Self {
        Self {
            client,
            buffer: DEFAULT_FORWARD_BUFFER,
        }
    }
}

#[async_trait]
impl AccountPubsub for SolanaPubsub {
    async fn account_subscribe(
        &self,
        key: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<NotificationStream, TransportError> {
        let client = self.client.clone();
        let key = *key;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.buffer);

        tokio::spawn(async move {
            let config = RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                data_slice: None,
                commitment: Some(CommitmentConfig { commitment }),
                min_context_slot: None,
            };
            let (mut stream, unsubscribe) = match client.account_subscribe(&key, Some(config)).await
            {
                Ok(subscription) => {
                    let _ = ready_tx.send(Ok(()));
                    subscription
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(response) => {
                            let slot = response.context.slot;
                            let account = response.value;
                            let data = if account.lamports == 0 {
                                None
                            } else {
                                match account.data.decode() {
                                    Some(bytes) => Some(bytes),
                                    None => {
                                        tracing::warn!(%key, slot, "Undecodable account notification dropped");
                                        continue;
                                    }
                                }
                            };
                            if tx.send(RawObservation::new(data, slot)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!(%key, "Account notification stream ended");
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                }
            }
            drop(stream);
            unsubscribe().await;
        });

        ready_rx.await.map_err(|_| TransportError::Closed)??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[async_trait]
impl LogPubsub for SolanaPubsub {
    async fn logs_subscribe(
        &self,
        address: &Pubkey,
        commitment: CommitmentLevel,
    ) -> Result<LogStream, TransportError> {
        let client = self.client.clone();
        let address = *address;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.buffer);

        tokio::spawn(async move {
            let (mut stream, unsubscribe) = match client
                .logs_subscribe(
                    RpcTransactionLogsFilter::Mentions(vec![address.to_string()]),
                    RpcTransactionLogsConfig {
                        commitment: Some(CommitmentConfig { commitment }),
                    },
                )
                .await
            {
                Ok(subscription) => {
                    let _ = ready_tx.send(Ok(()));
                    subscription
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(response) => {
                            let slot = response.context.slot;
                            let value = response.value;
                            let signature = match parse_signature(&value.signature) {
                                Ok(signature) => signature,
                                Err(e) => {
                                    tracing::warn!("Dropping log notification: {}", e);
                                    continue;
                                }
                            };
                            let logs = TransactionLogs {
                                signature,
                                slot,
                                err: value.err.map(|e| format!("{:?}", e)),
                                logs: value.logs,
                            };
                            if tx.send(logs).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!(%address, "Log notification stream ended");
                            break;
                        }
                    },
                    _ = tx.closed() => break,
                }
            }
            drop(stream);
            unsubscribe().await;
        });

        ready_rx.await.map_err(|_| TransportError::Closed)??;
        Ok(ReceiverStream::new(rx).boxed())
    }
}
