//! Storage collaborators
//!
//! - [`StateStore`]: durable current rated state with revision tokens
//! - [`StateCache`]: best-effort mirror of the state store
//! - [`LogStore`]: write-once rating log
//!
//! [`RatedStateAdapter`] and [`RatingLog`] wrap the raw backends with
//! cache-aside access, retries and circuit breaking.

mod eventstore;
mod log;
mod memory;
mod redis;
mod state;

pub use self::eventstore::{connect as connect_eventstore, EventStoreLogStore, EventStoreStateStore};
pub use self::log::RatingLog;
pub use self::memory::{MemoryLogStore, MemoryStateCache, MemoryStateStore};
pub use self::redis::RedisStateCache;
pub use self::state::RatedStateAdapter;

use async_trait::async_trait;
use tally_common::{LogKey, RatedUsageLogEntry, RatedUsageState, Result, Revision, StateKey};

/// Durable store of the current rated state per key
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Current state and its revision, if the key has ever been written
    async fn get(&self, key: &StateKey) -> Result<Option<(RatedUsageState, Revision)>>;

    /// Write a new state.
    ///
    /// `expected` is the revision the caller read (`None` for a key that does
    /// not exist yet). A mismatch fails with `ConcurrentRevisionConflict`.
    async fn put(
        &self,
        key: &StateKey,
        state: &RatedUsageState,
        expected: Option<Revision>,
    ) -> Result<Revision>;
}

/// Mirror of the state store, keyed identically
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn get(&self, key: &StateKey) -> Result<Option<RatedUsageState>>;

    async fn put(&self, key: &StateKey, state: &RatedUsageState) -> Result<()>;

    async fn remove(&self, key: &StateKey) -> Result<()>;
}

/// Append-only store of rating log entries
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Write an entry under a key that must not exist yet
    async fn put(&self, key: &LogKey, entry: &RatedUsageLogEntry) -> Result<Revision>;

    /// Read an entry, with `store_id` and `store_revision` filled in
    async fn get(&self, key: &LogKey) -> Result<Option<RatedUsageLogEntry>>;
}
