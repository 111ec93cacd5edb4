use super::types::TypedEvent;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::VecDeque};

/// Which clock orders an [`EventList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    /// Slot, then position within the transaction.
    #[default]
    Blockchain,
    /// Arrival at this client.
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDir {
    /// Newest first; eviction drops the oldest.
    #[default]
    Desc,
    Asc,
}

/// A bounded, always-sorted history of one event type.
///
/// Every insert keeps the list sorted; once it holds more than `max_size`
/// entries the tail is evicted.
#[derive(Debug, Clone)]
pub struct EventList<E> {
    max_size: usize,
    order_by: OrderBy,
    order_dir: OrderDir,
    events: VecDeque<TypedEvent<E>>,
}

impl<E: Clone> EventList<E> {
    pub fn new(max_size: usize, order_by: OrderBy, order_dir: OrderDir) -> Self {
        Self {
            max_size: max_size.max(1),
            order_by,
            order_dir,
            events: VecDeque::new(),
        }
    }

    /// Inserts `event` in order. Returns `false` if it was evicted straight away.
    pub fn insert(&mut self, event: TypedEvent<E>) -> bool {
        let at = self
            .events
            .partition_point(|existing| self.compare(existing, &event) != Ordering::Greater);
        self.events.insert(at, event);

        if self.events.len() > self.max_size {
            self.events.pop_back();
            return at < self.events.len();
        }
        true
    }

    /// Position of `a` relative to `b` in list order.
    fn compare(&self, a: &TypedEvent<E>, b: &TypedEvent<E>) -> Ordering {
        let ordering = match self.order_by {
            OrderBy::Blockchain => a
                .slot
                .cmp(&b.slot)
                .then(a.tx_event_index.cmp(&b.tx_event_index))
                .then(a.arrival.cmp(&b.arrival)),
            OrderBy::Client => a.arrival.cmp(&b.arrival),
        };
        match self.order_dir {
            OrderDir::Asc => ordering,
            OrderDir::Desc => ordering.reverse(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn first(&self) -> Option<&TypedEvent<E>> {
        self.events.front()
    }

    pub fn last(&self) -> Option<&TypedEvent<E>> {
        self.events.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypedEvent<E>> {
        self.events.iter()
    }

    pub fn to_vec(&self) -> Vec<TypedEvent<E>> {
        self.events.iter().cloned().collect()
    }

    /// Whether the list is sorted by its comparator.
    pub fn is_sorted(&self) -> bool {
        self.events
            .iter()
            .zip(self.events.iter().skip(1))
            .all(|(a, b)| self.compare(a, b) != Ordering::Greater)
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
