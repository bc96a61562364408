use crate::key::GenerationKey;
use chrono::{DateTime, Utc};
use genrelay_core::ArtifactRef;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
struct CachedArtifact {
    value: ArtifactRef,
    created_at: DateTime<Utc>,
    seq: u64,
}

/// Bounded cache of Ready generation results, evicted oldest-inserted first.
///
/// `order` may hold stale `(seq, key)` pairs for keys that were replaced or
/// removed; they are skipped during eviction and compacted once the queue
/// grows past twice the capacity.
#[derive(Debug)]
pub struct ReadyCache {
    capacity: usize,
    entries: HashMap<GenerationKey, CachedArtifact>,
    order: VecDeque<(u64, GenerationKey)>,
    next_seq: u64,
    evictions: u64,
}

impl ReadyCache {
    /// A cache holding at most `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            evictions: 0,
        }
    }

    /// Insert a Ready value, returning the keys evicted to stay within capacity.
    ///
    /// Re-inserting an existing key replaces its value and makes it the
    /// newest entry.
    pub fn insert(&mut self, key: GenerationKey, value: ArtifactRef) -> Vec<GenerationKey> {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.entries.insert(
            key.clone(),
            CachedArtifact {
                value,
                created_at: Utc::now(),
                seq,
            },
        );
        self.order.push_back((seq, key));

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((seq, key)) = self.order.pop_front() else {
                break;
            };
            if self.entries.get(&key).map(|e| e.seq) == Some(seq) {
                self.entries.remove(&key);
                self.evictions += 1;
                evicted.push(key);
            }
        }

        if self.order.len() > self.capacity.saturating_mul(2) {
            self.compact();
        }

        evicted
    }

    pub fn get(&self, key: &GenerationKey) -> Option<ArtifactRef> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn created_at(&self, key: &GenerationKey) -> Option<DateTime<Utc>> {
        self.entries.get(key).map(|e| e.created_at)
    }

    pub fn remove(&mut self, key: &GenerationKey) -> Option<ArtifactRef> {
        self.entries.remove(key).map(|e| e.value)
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

    /// Total number of entries evicted since creation.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Live keys, oldest insertion first.
    #[cfg(test)]
    fn keys_oldest_first(&self) -> Vec<GenerationKey> {
        self.order
            .iter()
            .filter(|(seq, key)| self.entries.get(key).map(|e| e.seq) == Some(*seq))
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| entries.get(key).map(|e| e.seq) == Some(*seq));
    }
}
