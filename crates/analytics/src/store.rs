// Copyright (C) 2025-present The ProbeWatch Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Keyed store of [`AggregateRecord`] values with per-key exclusive access.
//!
//! Keys are spread over a fixed number of shards. A shard lock is only held
//! while looking up or inserting a record handle; the read-modify-write cycle
//! of an aggregation runs under the record's own mutex. Updates to the same
//! key are therefore linearized, while distinct keys never wait on each
//! other's records.
//!
//! Records are never evicted by the store itself; [`RecordStore::remove`] is
//! left to the host.

use crate::{
    aggregation::{AggregationError, WindowAggregator},
    record::{AggregateRecord, Aggregates},
    sample::Sample,
};
use rustc_hash::{FxBuildHasher, FxHashMap};
use std::{
    hash::{BuildHasher, Hash},
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

const NUM_SHARDS_DEFAULT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    /// A previous holder of the record panicked while mutating it
    #[error("record lock poisoned by a panicked holder")]
    Poisoned,
}

impl StoreError {
    /// `true` when the sample was rejected by the aggregator and the record
    /// is unchanged, `false` for internal faults
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Aggregation(_))
    }
}

/// Shared handle to one record. Cloning the handle does not clone the record.
#[derive(Debug, Clone, Default)]
pub struct RecordHandle(Arc<Mutex<AggregateRecord>>);

impl RecordHandle {
    /// Acquire exclusive access to the record, released when the guard is
    /// dropped
    pub fn lock(&self) -> Result<RecordGuard<'_>, StoreError> {
        self.0
            .lock()
            .map(RecordGuard)
            .map_err(|_| StoreError::Poisoned)
    }
}

#[derive(Debug)]
pub struct RecordGuard<'a>(MutexGuard<'a, AggregateRecord>);

impl Deref for RecordGuard<'_> {
    type Target = AggregateRecord;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for RecordGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Debug)]
pub struct RecordStore<K> {
    shards: Box<[RwLock<FxHashMap<K, RecordHandle>>]>,
}

impl<K: Eq + Hash + Clone> RecordStore<K> {
    pub fn new(num_shards: usize) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect();
        Self { shards }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &K) -> &RwLock<FxHashMap<K, RecordHandle>> {
        let idx = FxBuildHasher.hash_one(key) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Handle of an existing record, `None` if the key was never seen
    pub fn get(&self, key: &K) -> Option<RecordHandle> {
        // Shard maps only hold handles, a panic cannot leave them half-updated
        self.shard(key)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Handle of the record for `key`, creating an empty record on first use
    pub fn get_or_create(&self, key: K) -> RecordHandle {
        if let Some(handle) = self.get(&key) {
            return handle;
        }
        self.shard(&key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    /// Apply `sample` to the record of `key` under the record's lock.
    pub fn apply(
        &self,
        key: K,
        aggregator: &WindowAggregator,
        sample: &Sample,
    ) -> Result<Aggregates, StoreError> {
        let handle = self.get_or_create(key);
        let mut record = handle.lock()?;
        Ok(aggregator.apply(&mut record, sample)?)
    }

    /// Run `f` with exclusive access to the record of `key`
    pub fn with_record<R>(
        &self,
        key: K,
        f: impl FnOnce(&mut AggregateRecord) -> R,
    ) -> Result<R, StoreError> {
        let handle = self.get_or_create(key);
        let mut record = handle.lock()?;
        Ok(f(&mut record))
    }

    /// Consistent copy of the record of `key`
    pub fn snapshot(&self, key: &K) -> Result<Option<AggregateRecord>, StoreError> {
        let Some(handle) = self.get(key) else {
            return Ok(None);
        };
        let record = handle.lock()?.clone();
        Ok(Some(record))
    }

    pub fn remove(&self, key: &K) -> Option<RecordHandle> {
        self.shard(key)
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

impl<K: Eq + Hash + Clone> Default for RecordStore<K> {
    fn default() -> Self {
        Self::new(NUM_SHARDS_DEFAULT)
    }
}
