//! Flattened result records

use serde::Serialize;

/// One leaf of a two-level drill-down: `(level-1 key, level-2 key, value)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrillDownRecord {
    level_1_key: String,
    level_2_key: String,
    value: f64,
}

impl DrillDownRecord {
    pub(crate) fn new(level_1_key: String, level_2_key: String, value: f64) -> Self {
        Self {
            level_1_key,
            level_2_key,
            value,
        }
    }

    pub fn level_1_key(&self) -> &str {
        &self.level_1_key
    }

    pub fn level_2_key(&self) -> &str {
        &self.level_2_key
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Full statistics of a numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsRecord {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub avg: f64,
}

/// Percentile (or percentile rank) results, ascending by key.
///
/// For percentiles the key is the percent and the value the field value
/// below which that share of observations falls; for ranks it is the other
/// way round.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct PercentileResult {
    entries: Vec<(f64, f64)>,
}

impl PercentileResult {
    pub(crate) fn from_entries(mut entries: Vec<(f64, f64)>) -> Self {
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { entries }
    }

    /// Value recorded for `key`, matched exactly.
    pub fn get(&self, key: f64) -> Option<f64> {
        self.entries
            .binary_search_by(|(k, _)| k.total_cmp(&key))
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn keys(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.entries.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
