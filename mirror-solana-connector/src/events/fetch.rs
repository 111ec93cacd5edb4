use crate::{
    error::TransportError,
    observation::Slot,
    transport::{LogHistory, TransactionLogs},
};
use futures::{stream, StreamExt};
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey, signature::Signature};

const TRANSACTION_FETCH_CONCURRENCY: usize = 10;

/// One page of transaction history.
///
/// The bounds describe the signature page as returned, including transactions
/// whose logs were unavailable, so callers can keep paging past them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchLogsResult {
    /// Oldest first.
    pub transactions: Vec<TransactionLogs>,
    pub signature_count: usize,
    pub earliest_tx: Option<Signature>,
    pub most_recent_tx: Option<Signature>,
    pub earliest_slot: Option<Slot>,
    pub most_recent_slot: Option<Slot>,
}

/// Fetches up to `limit` transactions mentioning `address`, newer than `until`
/// and older than `before` (both exclusive).
pub async fn fetch_logs(
    history: &dyn LogHistory,
    address: &Pubkey,
    before: Option<Signature>,
    until: Option<Signature>,
    limit: usize,
    commitment: CommitmentLevel,
) -> Result<FetchLogsResult, TransportError> {
    let signatures = history
        .get_signatures(address, before, until, limit, commitment)
        .await?;
    if signatures.is_empty() {
        return Ok(FetchLogsResult::default());
    }

    let most_recent = signatures.first();
    let earliest = signatures.last();
    let mut result = FetchLogsResult {
        transactions: Vec::with_capacity(signatures.len()),
        signature_count: signatures.len(),
        earliest_tx: earliest.map(|info| info.signature),
        most_recent_tx: most_recent.map(|info| info.signature),
        earliest_slot: earliest.map(|info| info.slot),
        most_recent_slot: most_recent.map(|info| info.slot),
    };

    let mut fetches = stream::iter(signatures.into_iter().rev())
        .map(|info| async move {
            let logs = history
                .get_transaction_logs(&info.signature, commitment)
                .await;
            (info, logs)
        })
        .buffered(TRANSACTION_FETCH_CONCURRENCY);

    while let Some((info, logs)) = fetches.next().await {
        match logs? {
            Some(mut logs) => {
                if logs.err.is_none() {
                    logs.err = info.err;
                }
                result.transactions.push(logs);
            }
            None => {
                tracing::debug!(signature = %info.signature, "Transaction logs unavailable, skipping");
            }
        }
    }
    Ok(result)
}
