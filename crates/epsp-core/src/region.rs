//! Per-region peer counts reported by the directory server.
//!
//! Wire form (`247` reply and `561` relayed update):
//!
//!   <region>,<count>;<region>,<count>;...
//!
//! The sum over all regions is the node's idea of the swarm size, which
//! bounds how far a relayed frame may travel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Regions shown by the `Display` summary.
const SUMMARY_REGIONS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCount {
    pub region: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCounts(Vec<RegionCount>);

impl RegionCounts {
    /// Parse a region list. Entries without a numeric count are skipped.
    pub fn parse(s: &str) -> Self {
        let counts = s
            .split(';')
            .filter_map(|entry| {
                let (region, count) = entry.split_once(',')?;
                let count = count.parse().ok()?;
                Some(RegionCount {
                    region: region.to_string(),
                    count,
                })
            })
            .collect();
        Self(counts)
    }

    /// Total peers across all regions.
    pub fn total(&self) -> u64 {
        self.0.iter().map(|r| r.count).fold(0, u64::saturating_add)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn regions(&self) -> &[RegionCount] {
        &self.0
    }

    pub fn get(&self, region: &str) -> Option<u64> {
        self.0.iter().find(|r| r.region == region).map(|r| r.count)
    }
}

impl fmt::Display for RegionCounts {
    /// The busiest regions, largest first: `250:40, 270:12`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sorted: Vec<&RegionCount> = self.0.iter().collect();
        sorted.sort_by(|a, b| b.count.cmp(&a.count));
        let summary: Vec<String> = sorted
            .into_iter()
            .take(SUMMARY_REGIONS)
            .map(|r| format!("{}:{}", r.region, r.count))
            .collect();
        f.write_str(&summary.join(", "))
    }
}
