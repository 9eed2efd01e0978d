//! State and log keys
//!
//! Keys are composed as `k/<organization_id>/t/<suffix>`:
//!
//! ```text
//! state key: k/<org>/t/<day>            one cumulative state, one lock
//! log key:   k/<org>/t/<day>/<sequence> one immutable rating log entry
//! ```
//!
//! `<day>` is the UTC midnight of the period end in Unix millis, rendered as a
//! 16 digit zero padded token so keys sort by day.

use super::usage::AggregatedUsageDoc;
use crate::error::{Result, TallyError};
use std::fmt;

/// Milliseconds in a UTC day
pub const DAY_MS: i64 = 86_400_000;

/// Earliest UTC midnight representable in Unix millis
pub const EARLIEST_DAY: i64 = (i64::MIN / DAY_MS) * DAY_MS;

/// UTC midnight (Unix millis) of the day containing `t`, or `None` when that
/// midnight precedes [`EARLIEST_DAY`]
pub fn checked_utc_day(t: i64) -> Option<i64> {
    t.div_euclid(DAY_MS).checked_mul(DAY_MS)
}

/// UTC midnight (Unix millis) of the day containing `t`.
///
/// Timestamps before [`EARLIEST_DAY`] map to it; inputs are range checked by
/// [`AggregatedUsageDoc::validate`] and [`LogKey::from_parts`].
pub fn utc_day(t: i64) -> i64 {
    checked_utc_day(t).unwrap_or(EARLIEST_DAY)
}

/// Key of the rated state for an organization and UTC day
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    organization_id: String,
    day: i64,
}

impl StateKey {
    pub fn new(organization_id: impl Into<String>, day: i64) -> Self {
        Self {
            organization_id: organization_id.into(),
            day: utc_day(day),
        }
    }

    /// Key for the UTC day of the usage period end
    pub fn for_usage(doc: &AggregatedUsageDoc) -> Self {
        Self::new(doc.organization_id.clone(), doc.end)
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn day(&self) -> i64 {
        self.day
    }

    /// Log key under this state key for the given sequence token
    pub fn log_key(&self, sequence: impl Into<String>) -> LogKey {
        LogKey {
            organization_id: self.organization_id.clone(),
            day: self.day,
            sequence: sequence.into(),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k/{}/t/{:016}", self.organization_id, self.day)
    }
}

/// Key of one rating log entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogKey {
    organization_id: String,
    day: i64,
    sequence: String,
}

impl LogKey {
    /// Rebuild a log key from its externally supplied parts
    pub fn from_parts(organization_id: &str, day: &str, sequence: &str) -> Result<Self> {
        if organization_id.is_empty() || organization_id.contains('/') {
            return Err(TallyError::Validation(format!(
                "invalid organization id: {:?}",
                organization_id
            )));
        }
        let day = day
            .parse::<i64>()
            .ok()
            .and_then(checked_utc_day)
            .ok_or_else(|| TallyError::Validation(format!("invalid day: {:?}", day)))?;
        if sequence.is_empty() || sequence.contains('/') {
            return Err(TallyError::Validation(format!(
                "invalid sequence: {:?}",
                sequence
            )));
        }
        Ok(Self {
            organization_id: organization_id.to_string(),
            day,
            sequence: sequence.to_string(),
        })
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn day(&self) -> i64 {
        self.day
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    /// State key this log entry belongs to
    pub fn state_key(&self) -> StateKey {
        StateKey::new(self.organization_id.clone(), self.day)
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "k/{}/t/{:016}/{}",
            self.organization_id, self.day, self.sequence
        )
    }
}
