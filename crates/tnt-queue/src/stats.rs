//! Statistics aggregation.
//!
//! The server keeps one flat counter namespace shared by every space:
//!
//! ```text
//! space0.emails.put           = "153"
//! space0.emails.tasks.ready   = "2"
//! space1.emails.put           = "9"
//! ```
//!
//! [`StatsAggregator`] keeps only the keys of the client's own space and
//! nests them per tube.

use crate::connection::Row;
use crate::error::StatsParseError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[cfg(test)]
#[path = "stats_tests.rs"]
mod tests;

const TASKS_SEGMENT: &str = "tasks";

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^space([^.]*)\.(.*)\.([^.]*)$").expect("statistics key pattern is valid")
    })
}

/// Counters for one tube
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TubeStats {
    /// Call counters such as `put`, `take` or `ack`
    #[serde(flatten)]
    pub metrics: BTreeMap<String, String>,
    /// Task counts per status, e.g. `ready`, `taken`, `total`
    pub tasks: BTreeMap<String, String>,
}

impl TubeStats {
    /// A call counter parsed as a number
    pub fn count(&self, metric: &str) -> Option<u64> {
        self.metrics.get(metric).and_then(|v| v.parse().ok())
    }

    /// A per-status task count parsed as a number
    pub fn task_count(&self, status: &str) -> Option<u64> {
        self.tasks.get(status).and_then(|v| v.parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty() && self.tasks.is_empty()
    }
}

/// Per-tube statistics for one space
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatsSnapshot {
    tubes: BTreeMap<String, TubeStats>,
}

impl StatsSnapshot {
    pub fn tube(&self, name: &str) -> Option<&TubeStats> {
        self.tubes.get(name)
    }

    /// Take one tube's statistics out of the snapshot, empty if the tube has
    /// no recorded activity
    pub fn into_tube(mut self, name: &str) -> TubeStats {
        self.tubes.remove(name).unwrap_or_default()
    }

    pub fn tubes(&self) -> impl Iterator<Item = (&str, &TubeStats)> {
        self.tubes.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    pub fn len(&self) -> usize {
        self.tubes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tubes.is_empty()
    }
}

/// Rebuilds the per-tube view of one space from the flat counter namespace
#[derive(Debug, Clone, Copy)]
pub struct StatsAggregator {
    space: u32,
}

impl StatsAggregator {
    pub fn new(space: u32) -> Self {
        Self { space }
    }

    pub fn space(&self) -> u32 {
        self.space
    }

    /// Split a statistics row of alternating keys and values into pairs.
    pub fn pairs_from_row(row: &Row) -> Result<Vec<(String, String)>, StatsParseError> {
        if row.len() % 2 != 0 {
            return Err(StatsParseError::UnpairedField { fields: row.len() });
        }

        Ok(row
            .chunks(2)
            .map(|pair| {
                (
                    String::from_utf8_lossy(pair[0].as_bytes()).into_owned(),
                    String::from_utf8_lossy(pair[1].as_bytes()).into_owned(),
                )
            })
            .collect())
    }

    /// Nest every counter of this space under its tube.
    ///
    /// Keys of other spaces are skipped. A key of this space that is neither
    /// `space<N>.<tube>.<metric>` nor `space<N>.<tube>.tasks.<status>` is an
    /// error.
    pub fn aggregate<I, K, V>(&self, entries: I) -> Result<StatsSnapshot, StatsParseError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut snapshot = StatsSnapshot::default();

        for (key, value) in entries {
            let key = key.as_ref();
            let captures = key_pattern()
                .captures(key)
                .ok_or_else(|| StatsParseError::UnrecognizedKey {
                    key: key.to_string(),
                })?;

            let space = &captures[1];
            let space: u32 = space.parse().map_err(|_| StatsParseError::InvalidSpace {
                key: key.to_string(),
                space: space.to_string(),
            })?;
            if space != self.space {
                continue;
            }

            let middle = &captures[2];
            let metric = &captures[3];

            if let Some(tube) = middle.strip_suffix(&format!(".{TASKS_SEGMENT}")) {
                // space, tube, "tasks", status
                let segments = 3 + tube.split('.').count();
                if segments != 4 {
                    return Err(StatsParseError::UnexpectedSegments {
                        key: key.to_string(),
                        segments,
                    });
                }
                snapshot
                    .tubes
                    .entry(tube.to_string())
                    .or_default()
                    .tasks
                    .insert(metric.to_string(), value.into());
            } else {
                snapshot
                    .tubes
                    .entry(middle.to_string())
                    .or_default()
                    .metrics
                    .insert(metric.to_string(), value.into());
            }
        }

        Ok(snapshot)
    }
}
