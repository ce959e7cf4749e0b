//! A bounded, insertion-ordered cache of the most recent signing records,
//! acting as a write-through front for the persisted store. It also carries
//! the running count of records ever inserted.

use crate::codec::SigningRecord;

use bitcoin::Txid;

use std::collections::VecDeque;

/// How many records the cache retains.
pub const CACHE_SIZE: usize = 100;

#[derive(Debug)]
pub struct RecencyCache {
    // Oldest-inserted entry at the front, newest at the back.
    entries: VecDeque<(Txid, SigningRecord)>,
    bound: usize,
    total: u64,
}

impl RecencyCache {
    pub fn new(bound: usize) -> Self {
        RecencyCache {
            entries: VecDeque::with_capacity(bound),
            bound,
            total: 0,
        }
    }

    /// Record a fresh insertion, evicting the oldest surviving entry if the
    /// bound is reached, and bump the running total.
    pub fn push(&mut self, key: Txid, record: SigningRecord) {
        self.entries.push_back((key, record));
        if self.entries.len() > self.bound {
            self.entries.pop_front();
        }
        self.total += 1;
    }

    /// Re-insert a previously evicted record at the old end. Used when
    /// re-warming from a store scan; never evicts and never counts towards
    /// the total.
    pub fn warm_oldest(&mut self, key: Txid, record: SigningRecord) {
        if self.entries.len() < self.bound {
            self.entries.push_front((key, record));
        }
    }

    pub fn get(&self, key: &Txid) -> Option<&SigningRecord> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, record)| record)
    }

    pub fn contains(&self, key: &Txid) -> bool {
        self.get(key).is_some()
    }

    /// Flip the completion flag on the cached copy, if present.
    pub fn set_completed(&mut self, key: &Txid) {
        if let Some((_, record)) = self.entries.iter_mut().rev().find(|(k, _)| k == key) {
            record.completed = true;
        }
    }

    /// All cached records, most recently inserted first.
    pub fn newest_first(&self) -> Vec<SigningRecord> {
        self.entries
            .iter()
            .rev()
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn set_total(&mut self, total: u64) {
        self.total = total;
    }
}
