use super::types::TypedEvent;
use solana_sdk::signature::Signature;
use std::collections::{BTreeMap, HashMap};

struct CacheEntry<E> {
    events: Vec<TypedEvent<E>>,
    stamp: u64,
}

/// Transaction-keyed LRU cache of parsed events.
///
/// Inserting or reading through [`TxEventCache::get`] moves a transaction to the
/// head; once the cache holds more than `capacity` transactions the least
/// recently used one is evicted.
pub struct TxEventCache<E> {
    capacity: usize,
    entries: HashMap<Signature, CacheEntry<E>>,
    recency: BTreeMap<u64, Signature>,
    clock: u64,
}

impl<E: Clone> TxEventCache<E> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Inserts or replaces the events of `signature`, returning the evicted entry if any.
    pub fn insert(
        &mut self,
        signature: Signature,
        events: Vec<TypedEvent<E>>,
    ) -> Option<(Signature, Vec<TypedEvent<E>>)> {
        let stamp = self.tick();
        if let Some(previous) = self.entries.insert(signature, CacheEntry { events, stamp }) {
            self.recency.remove(&previous.stamp);
        }
        self.recency.insert(stamp, signature);

        if self.entries.len() <= self.capacity {
            return None;
        }
        let (_, oldest) = self.recency.pop_first()?;
        self.entries
            .remove(&oldest)
            .map(|entry| (oldest, entry.events))
    }

    /// Membership check that leaves recency untouched.
    pub fn contains(&self, signature: &Signature) -> bool {
        self.entries.contains_key(signature)
    }

    pub fn peek(&self, signature: &Signature) -> Option<&[TypedEvent<E>]> {
        self.entries
            .get(signature)
            .map(|entry| entry.events.as_slice())
    }

    /// Reads the events of `signature` and marks it most recently used.
    pub fn get(&mut self, signature: &Signature) -> Option<&[TypedEvent<E>]> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(signature)?;
        self.recency.remove(&entry.stamp);
        entry.stamp = stamp;
        self.recency.insert(stamp, *signature);
        Some(entry.events.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Cached transactions, most recently used first.
    pub fn keys_by_recency(&self) -> Vec<Signature> {
        self.recency.values().rev().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }
}
