use crate::{error::SyncError, observation::Slot};
use solana_sdk::signature::Signature;
use std::sync::Arc;

/// Where an event entered the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    /// Delivered by the log provider.
    Live,
    /// Fetched while walking history backwards.
    Backfill,
}

/// One decoded program event.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedEvent<E> {
    pub signature: Signature,
    pub slot: Slot,
    /// Position of the event within its transaction's parse.
    pub tx_event_index: usize,
    pub event_type: String,
    pub payload: E,
    /// Monotonic insertion counter, used for client-side ordering.
    pub arrival: u64,
    pub source: EventSource,
}

/// Signals emitted to a pipeline's listeners.
#[derive(Debug, Clone)]
pub enum PipelineEvent<E> {
    NewEvent(TypedEvent<E>),
    Error {
        signature: Option<Signature>,
        error: Arc<SyncError>,
    },
}
