//! Rated usage state and rating log entries
//!
//! - [`RatedUsageState`]: the current cumulative rated document for one
//!   (organization, UTC day) key. Superseded on every update, never edited.
//! - [`RatedUsageLogEntry`]: immutable point-in-time snapshot written once per
//!   submitted usage document.

use super::usage::{AggregatedUsageDoc, ResourceUsage, SpaceUsage};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Opaque optimistic-concurrency token
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// First revision of a newly created document
    pub const INITIAL: Revision = Revision(0);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Rated usage tree for an organization and period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedUsage {
    pub organization_id: String,
    /// Period start (Unix millis)
    pub start: i64,
    /// Period end (Unix millis)
    pub end: i64,
    #[serde(default)]
    pub resources: Vec<ResourceUsage>,
    #[serde(default)]
    pub spaces: Vec<SpaceUsage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RatedUsage {
    /// Empty rated tree seeded with the organization and period of a usage doc
    pub fn seed(doc: &AggregatedUsageDoc) -> Self {
        Self {
            organization_id: doc.organization_id.clone(),
            start: doc.start,
            end: doc.end,
            resources: Vec::new(),
            spaces: Vec::new(),
            extra: Map::new(),
        }
    }
}

/// Current rated state for one state key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedUsageState {
    /// State key, assigned when the state is persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub usage: RatedUsage,
    /// Log id of the last usage document folded into this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rated_usage_id: Option<String>,
    /// Id of the last aggregated usage document folded into this state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_usage_id: Option<String>,
    /// Durable store revision this value was read at (or written as)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<Revision>,
    /// Cache revision this value was read at (or written as)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_revision: Option<Revision>,
}

impl RatedUsageState {
    /// Initial state for a key that has never been rated
    pub fn seed(doc: &AggregatedUsageDoc) -> Self {
        Self::from_usage(RatedUsage::seed(doc))
    }

    pub fn from_usage(usage: RatedUsage) -> Self {
        Self {
            id: None,
            usage,
            last_rated_usage_id: None,
            aggregated_usage_id: None,
            revision: None,
            cache_revision: None,
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.usage.organization_id
    }
}

/// Immutable snapshot of a rated state, written once per rated usage document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatedUsageLogEntry {
    /// Log id (`k/<org>/t/<day>/<seq>`)
    pub id: String,
    /// Id of the aggregated usage document this entry was rated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregated_usage_id: Option<String>,
    #[serde(flatten)]
    pub usage: RatedUsage,
    /// Storage location assigned by the log store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    /// Storage revision assigned by the log store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_revision: Option<Revision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rated_usage_id: Option<String>,
}

impl RatedUsageLogEntry {
    /// Snapshot a folded state for the usage document it was folded from
    pub fn snapshot(
        log_id: impl Into<String>,
        state: &RatedUsageState,
        aggregated_usage_id: Option<String>,
    ) -> Self {
        Self {
            id: log_id.into(),
            aggregated_usage_id,
            usage: state.usage.clone(),
            store_id: None,
            store_revision: None,
            last_rated_usage_id: state.last_rated_usage_id.clone(),
        }
    }

    /// Strip storage bookkeeping before handing the entry to a caller
    pub fn redacted(mut self) -> Self {
        self.store_id = None;
        self.store_revision = None;
        self.last_rated_usage_id = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::usage::PlanUsage;
    use rust_decimal_macros::dec;

    fn state() -> RatedUsageState {
        let doc = AggregatedUsageDoc::new("org1", 0, 100).with_resource(
            ResourceUsage::new("test-resource")
                .with_plan(PlanUsage::new("basic").with_metric("memory", dec!(10))),
        );
        let mut state = RatedUsageState::seed(&doc);
        state.usage.resources = doc.resources.clone();
        state.id = Some("k/org1/t/0000000000000000".into());
        state.revision = Some(Revision(3));
        state.cache_revision = Some(Revision(1));
        state.last_rated_usage_id = Some("k/org1/t/0000000000000000/prev".into());
        state
    }

    #[test]
    fn test_revision_next() {
        assert_eq!(Revision::INITIAL.next(), Revision(1));
        assert_eq!(Revision(41).next().to_string(), "42");
    }

    #[test]
    fn test_state_serializes_flat() {
        let value = serde_json::to_value(state()).unwrap();
        assert_eq!(value["organization_id"], "org1");
        assert_eq!(value["revision"], 3);
        assert_eq!(value["cache_revision"], 1);
        assert!(value.get("usage").is_none());

        let back: RatedUsageState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state());
    }

    #[test]
    fn test_redacted_log_entry_omits_bookkeeping() {
        let mut entry = RatedUsageLogEntry::snapshot(
            "k/org1/t/0000000000000000/0001",
            &state(),
            Some("agg-1".into()),
        );
        entry.store_id = Some("tally-rated-usage-log-k/org1".into());
        entry.store_revision = Some(Revision::INITIAL);

        let value = serde_json::to_value(entry.redacted()).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("store_id"));
        assert!(!object.contains_key("store_revision"));
        assert!(!object.contains_key("last_rated_usage_id"));
        assert_eq!(object["aggregated_usage_id"], "agg-1");
        assert_eq!(object["id"], "k/org1/t/0000000000000000/0001");
    }

    #[test]
    fn test_snapshot_does_not_carry_state_revisions() {
        let entry = RatedUsageLogEntry::snapshot("log", &state(), None);
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("revision").is_none());
        assert!(value.get("cache_revision").is_none());
    }
}
