//! Bounded conflict-key cache.
//!
//! Every committed write records `key -> address`. When the cache is full the
//! entries with the lowest address are evicted and their address is folded
//! into `max_conflict_wildcard`: a reader whose snapshot is below the wildcard
//! can no longer be certified and must abort. Eviction is strictly by address,
//! never by access recency.
//!
//! Entries live in a slot arena. `index` maps a key to its slot and `order`
//! holds `(version, slot)` pairs sorted ascending; the two are kept in
//! lockstep and any divergence is reported as an integrity error.

use crate::error::SeqlogError;
use crate::token::{ConflictKey, NON_ADDRESS};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, trace};


#[derive(Debug, Clone)]
struct Slot {
    key: ConflictKey,
    version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheWatermarks {
    pub max_conflict_wildcard: u64,
    pub max_conflict_new_sequencer: u64,
    pub max_inserted: u64,
}

#[derive(Debug)]
pub struct ConflictCache {
    slots: Vec<Option<Slot>>,
    free_slots: Vec<usize>,
    index: HashMap<ConflictKey, usize>,
    order: BTreeSet<(u64, usize)>,
    capacity: usize,
    max_inserted: u64,
    max_conflict_wildcard: u64,
    max_conflict_new_sequencer: u64,
}

impl ConflictCache {
    pub fn new(capacity: usize) -> Result<Self, SeqlogError> {
        if capacity == 0 {
            return Err(SeqlogError::InvalidConfig {
                message: "conflict cache capacity must be > 0".into(),
            });
        }
        Ok(Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            index: HashMap::new(),
            order: BTreeSet::new(),
            capacity,
            max_inserted: NON_ADDRESS,
            max_conflict_wildcard: NON_ADDRESS,
            max_conflict_new_sequencer: NON_ADDRESS,
        })
    }

    pub fn get_if_present(&self, key: &ConflictKey) -> Option<u64> {
        let slot = *self.index.get(key)?;
        self.slots
            .get(slot)
            .and_then(Option::as_ref)
            .map(|entry| entry.version)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lowest version still tracked, if any.
    pub fn first_version(&self) -> Option<u64> {
        self.order.first().map(|&(version, _)| version)
    }

    pub fn max_inserted(&self) -> u64 {
        self.max_inserted
    }

    pub fn max_conflict_wildcard(&self) -> u64 {
        self.max_conflict_wildcard
    }

    pub fn max_conflict_new_sequencer(&self) -> u64 {
        self.max_conflict_new_sequencer
    }

    pub fn watermarks(&self) -> CacheWatermarks {
        CacheWatermarks {
            max_conflict_wildcard: self.max_conflict_wildcard,
            max_conflict_new_sequencer: self.max_conflict_new_sequencer,
            max_inserted: self.max_inserted,
        }
    }

    /// Records that `key` was last written at `version`.
    ///
    /// A new key arriving at a full cache first evicts every entry that shares
    /// the lowest version, raising the wildcard to that version.
    pub fn put(&mut self, key: ConflictKey, version: u64) -> Result<(), SeqlogError> {
        if let Some(&slot) = self.index.get(&key) {
            let entry = self
                .slots
                .get_mut(slot)
                .and_then(Option::as_mut)
                .ok_or_else(|| {
                    SeqlogError::integrity(format!("index points at empty slot {slot}"))
                })?;
            let previous = entry.version;
            entry.version = version;
            if !self.order.remove(&(previous, slot)) {
                return Err(SeqlogError::integrity(format!(
                    "slot {slot} missing from eviction order at version {previous}"
                )));
            }
            self.order.insert((version, slot));
        } else {
            if self.index.len() >= self.capacity {
                self.evict_oldest_batch()?;
            }
            let slot = self.alloc_slot(Slot {
                key: key.clone(),
                version,
            });
            self.index.insert(key, slot);
            self.order.insert((version, slot));
        }
        self.max_inserted = self.max_inserted.max(version);
        Ok(())
    }

    /// Evicts every entry whose version is below `trim_mark`. Returns the
    /// number of evicted entries.
    pub fn invalidate_up_to(&mut self, trim_mark: u64) -> Result<usize, SeqlogError> {
        debug!(trim_mark, "invalidating conflict cache");
        let mut evicted = 0usize;
        while let Some(first) = self.first_version() {
            if first >= trim_mark {
                break;
            }
            self.evict_first()?;
            evicted += 1;
        }
        debug!(
            trim_mark,
            evicted,
            max_conflict_wildcard = self.max_conflict_wildcard,
            "conflict cache invalidated"
        );
        Ok(evicted)
    }

    /// Drops every entry and raises the wildcard to the highest version ever
    /// inserted.
    pub fn invalidate_all(&mut self) -> usize {
        let dropped = self.index.len();
        info!(
            dropped,
            max_conflict_wildcard = self.max_inserted,
            "invalidating all conflict cache entries"
        );
        self.slots.clear();
        self.free_slots.clear();
        self.index.clear();
        self.order.clear();
        self.max_conflict_wildcard = self.max_conflict_wildcard.max(self.max_inserted);
        dropped
    }

    /// Installs the watermark handed over at primary-sequencer election.
    ///
    /// Entries below the watermark are dropped since every snapshot below it
    /// aborts anyway. Both watermarks only move up; a lower `watermark` still
    /// drops nothing that is not already covered. Returns the number of
    /// dropped entries.
    pub fn update_max_conflict_address(&mut self, watermark: u64) -> Result<usize, SeqlogError> {
        info!(watermark, "updating max conflict address");
        let mut dropped = 0usize;
        while let Some(first) = self.first_version() {
            if first >= watermark {
                break;
            }
            self.evict_first()?;
            dropped += 1;
        }
        self.max_conflict_wildcard = self.max_conflict_wildcard.max(watermark);
        self.max_conflict_new_sequencer = self.max_conflict_new_sequencer.max(watermark);
        self.max_inserted = self.max_inserted.max(watermark);
        Ok(dropped)
    }

    /// Starts a fresh epoch: drops every entry and installs `watermark` as
    /// the wildcard and new-sequencer watermarks, even when it is lower than
    /// the previous ones. Only sound when snapshots from the previous epoch
    /// are rejected by their epoch. Returns the number of dropped entries.
    pub fn reset_for_epoch(&mut self, watermark: u64) -> usize {
        let dropped = self.index.len();
        info!(dropped, watermark, "resetting conflict cache for new epoch");
        self.slots.clear();
        self.free_slots.clear();
        self.index.clear();
        self.order.clear();
        self.max_conflict_wildcard = watermark;
        self.max_conflict_new_sequencer = watermark;
        self.max_inserted = watermark;
        dropped
    }

    /// Verifies that the index, the eviction order and the arena agree.
    pub fn check_invariants(&self) -> Result<(), SeqlogError> {
        if self.index.len() > self.capacity {
            return Err(SeqlogError::integrity(format!(
                "cache holds {} keys, capacity is {}",
                self.index.len(),
                self.capacity
            )));
        }
        if self.index.len() != self.order.len() {
            return Err(SeqlogError::integrity(format!(
                "index has {} keys but eviction order has {} records",
                self.index.len(),
                self.order.len()
            )));
        }
        for &(version, slot) in &self.order {
            let entry = self
                .slots
                .get(slot)
                .and_then(Option::as_ref)
                .ok_or_else(|| {
                    SeqlogError::integrity(format!("ordered slot {slot} is empty"))
                })?;
            if entry.version != version {
                return Err(SeqlogError::integrity(format!(
                    "slot {slot} holds version {} but is ordered at {version}",
                    entry.version
                )));
            }
            if self.index.get(&entry.key) != Some(&slot) {
                return Err(SeqlogError::integrity(format!(
                    "key {} is not indexed at slot {slot}",
                    entry.key
                )));
            }
        }
        let live = self.slots.iter().filter(|s| s.is_some()).count();
        if live != self.index.len() {
            return Err(SeqlogError::integrity(format!(
                "{live} live slots for {} indexed keys",
                self.index.len()
            )));
        }
        if let Some(first) = self.first_version()
            && first < self.max_conflict_wildcard
        {
            return Err(SeqlogError::integrity(format!(
                "live version {first} is below wildcard {}",
                self.max_conflict_wildcard
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn forget_eviction_order(&mut self) {
        self.order.clear();
    }

    fn alloc_slot(&mut self, entry: Slot) -> usize {
        match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    fn evict_oldest_batch(&mut self) -> Result<usize, SeqlogError> {
        let Some(oldest) = self.first_version() else {
            return Err(SeqlogError::integrity(
                "cache is full but its eviction order is empty",
            ));
        };
        let mut evicted = 0usize;
        while self.first_version() == Some(oldest) {
            self.evict_first()?;
            evicted += 1;
        }
        Ok(evicted)
    }

    fn evict_first(&mut self) -> Result<u64, SeqlogError> {
        let (version, slot) = self
            .order
            .pop_first()
            .ok_or_else(|| SeqlogError::integrity("eviction order is empty"))?;
        let entry = self
            .slots
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| SeqlogError::integrity(format!("evicted slot {slot} is empty")))?;
        self.free_slots.push(slot);
        if self.index.remove(&entry.key) != Some(slot) {
            return Err(SeqlogError::integrity(format!(
                "key {} was not indexed at evicted slot {slot}",
                entry.key
            )));
        }
        if entry.version != version {
            return Err(SeqlogError::integrity(format!(
                "slot {slot} holds version {} but was ordered at {version}",
                entry.version
            )));
        }
        trace!(
            key = %entry.key,
            version,
            previous_wildcard = self.max_conflict_wildcard,
            "evicting conflict key"
        );
        self.max_conflict_wildcard = self.max_conflict_wildcard.max(version);
        Ok(version)
    }
}
