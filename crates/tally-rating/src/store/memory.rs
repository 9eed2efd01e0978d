//! In-memory backends
//!
//! Used by tests and when the service runs with the `memory` storage and cache
//! backends. Each backend counts writes and can be told to fail upcoming
//! writes with a transient storage error.

use super::{LogStore, StateCache, StateStore};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tally_common::{
    LogKey, RatedUsageLogEntry, RatedUsageState, Result, Revision, StateKey, TallyError,
};
use tracing::debug;

#[derive(Debug, Default)]
struct WriteStats {
    writes: AtomicU64,
    failures_pending: AtomicU32,
}

impl WriteStats {
    fn begin_write(&self, backend: &str) -> Result<()> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TallyError::Storage(format!("{} write failed", backend)));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory state store with monotonic revisions
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    states: DashMap<String, (RatedUsageState, Revision)>,
    stats: WriteStats,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful writes so far
    pub fn put_count(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    /// Fail the next `n` writes with a storage error
    pub fn fail_next_puts(&self, n: u32) {
        self.stats.failures_pending.store(n, Ordering::Release);
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &StateKey) -> Result<Option<(RatedUsageState, Revision)>> {
        Ok(self.states.get(&key.to_string()).map(|entry| {
            let (state, revision) = entry.value();
            let mut state = state.clone();
            state.revision = Some(*revision);
            (state, *revision)
        }))
    }

    async fn put(
        &self,
        key: &StateKey,
        state: &RatedUsageState,
        expected: Option<Revision>,
    ) -> Result<Revision> {
        let conflict = || TallyError::ConcurrentRevisionConflict {
            key: key.to_string(),
            expected: expected.map(|r| r.0),
        };

        match self.states.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().1;
                if expected != Some(current) {
                    return Err(conflict());
                }
                self.stats.begin_write("state store")?;
                let next = current.next();
                entry.insert((state.clone(), next));
                debug!(key = %key, revision = %next, "Stored rated state");
                Ok(next)
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Err(conflict());
                }
                self.stats.begin_write("state store")?;
                entry.insert((state.clone(), Revision::INITIAL));
                debug!(key = %key, revision = %Revision::INITIAL, "Stored rated state");
                Ok(Revision::INITIAL)
            }
        }
    }
}

/// In-memory state cache
#[derive(Debug, Default)]
pub struct MemoryStateCache {
    states: DashMap<String, RatedUsageState>,
    stats: WriteStats,
}

impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.stats.failures_pending.store(n, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn get(&self, key: &StateKey) -> Result<Option<RatedUsageState>> {
        Ok(self.states.get(&key.to_string()).map(|s| s.value().clone()))
    }

    async fn put(&self, key: &StateKey, state: &RatedUsageState) -> Result<()> {
        self.stats.begin_write("cache")?;
        self.states.insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn remove(&self, key: &StateKey) -> Result<()> {
        self.states.remove(&key.to_string());
        Ok(())
    }
}

/// In-memory write-once log store
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: DashMap<String, (RatedUsageLogEntry, Revision)>,
    stats: WriteStats,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_count(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.stats.failures_pending.store(n, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn put(&self, key: &LogKey, entry: &RatedUsageLogEntry) -> Result<Revision> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => Err(TallyError::ConcurrentRevisionConflict {
                key: key.to_string(),
                expected: None,
            }),
            Entry::Vacant(slot) => {
                self.stats.begin_write("log store")?;
                slot.insert((entry.clone(), Revision::INITIAL));
                Ok(Revision::INITIAL)
            }
        }
    }

    async fn get(&self, key: &LogKey) -> Result<Option<RatedUsageLogEntry>> {
        let id = key.to_string();
        Ok(self.entries.get(&id).map(|stored| {
            let (entry, revision) = stored.value();
            let mut entry = entry.clone();
            entry.store_id = Some(id.clone());
            entry.store_revision = Some(*revision);
            entry
        }))
    }
}
