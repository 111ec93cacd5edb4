//! Slot-versioned observations and the dedup rule every component applies.

use std::cmp::Ordering;

/// Ledger sequence number.
pub type Slot = u64;

/// Orders two observations by slot. Plain numeric order, no special cases.
pub fn compare_slots(a: Slot, b: Slot) -> Ordering {
    a.cmp(&b)
}

/// Undecoded account state as delivered by a transport.
///
/// `data` is `None` when the account does not exist at `slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObservation {
    pub data: Option<Vec<u8>>,
    pub slot: Slot,
}

impl RawObservation {
    pub fn new(data: Option<Vec<u8>>, slot: Slot) -> Self {
        Self { data, slot }
    }

    pub fn absent(slot: Slot) -> Self {
        Self { data: None, slot }
    }

    /// Both absent, or byte-identical.
    pub fn same_bytes(&self, other: &RawObservation) -> bool {
        self.data == other.data
    }

    /// Whether this observation may replace `cached`.
    ///
    /// Accepted when nothing is cached yet, or when the slot is strictly greater
    /// and the bytes differ. Equal-slot observations never overwrite.
    pub fn supersedes(&self, cached: Option<&RawObservation>) -> bool {
        match cached {
            None => true,
            Some(cached) => {
                compare_slots(self.slot, cached.slot) == Ordering::Greater
                    && !self.same_bytes(cached)
            }
        }
    }
}

/// Replaces `cached` with `candidate` when the dedup rule allows it.
pub(crate) fn replace_if_newer(
    cached: &mut Option<RawObservation>,
    candidate: &RawObservation,
) -> bool {
    if candidate.supersedes(cached.as_ref()) {
        *cached = Some(candidate.clone());
        true
    } else {
        false
    }
}

/// A decoded value together with the slot it was observed at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedValue<T> {
    pub data: T,
    pub slot: Slot,
}
