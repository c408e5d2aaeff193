use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::index::{CacheEntry, Counters};

/// Statistics derived from the index state. `operation_metrics`, `error_count`, and `shard_info`
/// are reserved for implementations that track them: this one populates `operation_metrics` (a
/// natural extension of the per-tier breakdown the cache already tracks) and leaves
/// `error_count`/`shard_info` at zero since there is no sharding implementation here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatistics {
    pub entry_count: u64,
    pub total_size: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub last_modified: DateTime<Utc>,
    pub last_gc: Option<DateTime<Utc>>,
    pub hit_rate: f64,
    pub oldest_entry_age_seconds: Option<i64>,
    pub most_recent_entry_age_seconds: Option<i64>,
    pub average_entry_size: u64,
    pub operation_metrics: BTreeMap<&'static str, u64>,
    pub error_count: u64,
    pub shard_info: Option<String>,
}

pub fn derive<'a>(
    counters: &Counters,
    entries: impl Iterator<Item = &'a CacheEntry>,
) -> CacheStatistics {
    let now = Utc::now();
    let mut oldest: Option<DateTime<Utc>> = None;
    let mut newest: Option<DateTime<Utc>> = None;
    let mut operation_metrics: BTreeMap<&'static str, u64> = BTreeMap::new();

    for entry in entries {
        let created = entry.metadata.created_at;
        oldest = Some(oldest.map_or(created, |o| o.min(created)));
        newest = Some(newest.map_or(created, |n| n.max(created)));
        *operation_metrics
            .entry(entry.metadata.operation_type.as_str())
            .or_insert(0) += 1;
    }

    let hit_rate = if counters.hit_count + counters.miss_count == 0 {
        0.0
    } else {
        counters.hit_count as f64 / (counters.hit_count + counters.miss_count) as f64
    };

    let average_entry_size = if counters.entry_count == 0 {
        0
    } else {
        counters.total_size / counters.entry_count
    };

    CacheStatistics {
        entry_count: counters.entry_count,
        total_size: counters.total_size,
        hit_count: counters.hit_count,
        miss_count: counters.miss_count,
        eviction_count: counters.eviction_count,
        last_modified: counters.last_modified,
        last_gc: counters.last_gc,
        hit_rate,
        oldest_entry_age_seconds: oldest.map(|o| (now - o).num_seconds()),
        most_recent_entry_age_seconds: newest.map(|n| (now - n).num_seconds()),
        average_entry_size,
        operation_metrics,
        error_count: 0,
        shard_info: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_with_no_traffic() {
        let counters = Counters {
            total_size: 0,
            entry_count: 0,
            hit_count: 0,
            miss_count: 0,
            eviction_count: 0,
            last_modified: Utc::now(),
            last_gc: None,
        };
        let stats = derive(&counters, std::iter::empty());
        assert_eq!(stats.hit_rate, 0.0);
        assert_eq!(stats.average_entry_size, 0);
    }

    #[test]
    fn hit_rate_reflects_counters() {
        let counters = Counters {
            total_size: 300,
            entry_count: 3,
            hit_count: 3,
            miss_count: 1,
            eviction_count: 0,
            last_modified: Utc::now(),
            last_gc: None,
        };
        let stats = derive(&counters, std::iter::empty());
        assert_eq!(stats.hit_rate, 0.75);
        assert_eq!(stats.average_entry_size, 100);
    }
}
