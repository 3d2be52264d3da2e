//! Scan strategy selection
//!
//! For every filter key that has posting lists the planner estimates
//! selectivity as the number of in-range index entries for the allowed
//! values divided by the number of points in the measurement. The most
//! selective key drives an index scan when it is below the threshold;
//! otherwise the store is scanned in full. Either way every candidate is
//! re-checked against the whole predicate, so the choice never changes
//! the result.

use crate::index::TagTimeIndex;
use crate::query::descriptor::QueryDescriptor;
use crate::storage::{PointOffset, StorageResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How the caller wants candidates produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPreference {
    /// Cost-based choice
    #[default]
    Auto,
    /// Use an index whenever a filter key is indexed
    Index,
    /// Always scan the store
    Full,
}

impl FromStr for ScanPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "index" => Ok(Self::Index),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown scan preference: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScanStrategy {
    /// Merge the posting lists of `tag_key` for each allowed value
    IndexScan { tag_key: String, values: Vec<String> },
    FullScan,
}

/// Chosen strategy plus the snapshot it runs against
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    pub strategy: ScanStrategy,
    /// Estimate for the chosen (or best rejected) filter key
    pub selectivity: Option<f64>,
    /// Offsets at or beyond this are invisible to the query
    pub watermark: PointOffset,
}

impl ScanPlan {
    pub fn is_index_scan(&self) -> bool {
        matches!(self.strategy, ScanStrategy::IndexScan { .. })
    }

    /// Short form in the style of a slow-query log line
    pub fn summary(&self) -> String {
        match &self.strategy {
            ScanStrategy::IndexScan { tag_key, values } => {
                format!("IXSCAN {{ {}: [{}] }}", tag_key, values.join(", "))
            }
            ScanStrategy::FullScan => "COLLSCAN".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Index scans are chosen below this selectivity
    pub selectivity_threshold: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            selectivity_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPlanner {
    config: PlannerConfig,
}

impl QueryPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn plan(
        &self,
        query: &QueryDescriptor,
        index: &TagTimeIndex,
        watermark: PointOffset,
        preference: ScanPreference,
    ) -> StorageResult<ScanPlan> {
        let total = index.measurement_points(&query.measurement)?;

        // Most selective indexed key; ties go to the first key in name order
        let mut best: Option<(&String, f64)> = None;
        for (key, values) in &query.tag_filter {
            if !index.is_indexed(key) {
                continue;
            }
            let mut touched = 0u64;
            for value in values {
                touched += index.count_in_range(&query.measurement, key, value, query.time_range)?;
            }
            let selectivity = if total == 0 {
                0.0
            } else {
                touched as f64 / total as f64
            };
            tracing::trace!(key = %key, touched, total, selectivity, "Filter key estimate");

            if best.map(|(_, s)| selectivity < s).unwrap_or(true) {
                best = Some((key, selectivity));
            }
        }

        let use_index = match (preference, best) {
            (ScanPreference::Full, _) | (_, None) => false,
            (ScanPreference::Index, Some(_)) => true,
            (ScanPreference::Auto, Some((_, s))) => s < self.config.selectivity_threshold,
        };

        let strategy = match best {
            Some((key, _)) if use_index => ScanStrategy::IndexScan {
                tag_key: key.clone(),
                values: query.tag_filter[key].iter().cloned().collect(),
            },
            _ => ScanStrategy::FullScan,
        };

        Ok(ScanPlan {
            strategy,
            selectivity: best.map(|(_, s)| s),
            watermark,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexConfig;
    use crate::storage::Point;

    /// 10 hosts × 10 points, one per second
    fn populated(config: IndexConfig) -> TagTimeIndex {
        let index = TagTimeIndex::new(config);
        for i in 0..100u64 {
            let point = Point::new("cpu", i as i64 * 1000)
                .tag("hostname", format!("host_{}", i % 10))
                .tag("arch", if i % 2 == 0 { "x64" } else { "arm" });
            index.index_point(i, &point).unwrap();
        }
        index
    }

    fn query(hosts: &[&str]) -> QueryDescriptor {
        QueryDescriptor::builder("cpu")
            .tag_in("hostname", hosts.iter().copied())
            .time_range(0, 100_000)
            .max("usage_user")
            .build()
    }

    #[test]
    fn test_selective_filter_uses_index() {
        let index = populated(IndexConfig::default());
        let plan = QueryPlanner::default()
            .plan(&query(&["host_0", "host_3"]), &index, 100, ScanPreference::Auto)
            .unwrap();

        assert_eq!(
            plan.strategy,
            ScanStrategy::IndexScan {
                tag_key: "hostname".into(),
                values: vec!["host_0".into(), "host_3".into()],
            }
        );
        assert_eq!(plan.selectivity, Some(0.2));
        assert_eq!(plan.summary(), "IXSCAN { hostname: [host_0, host_3] }");
    }

    #[test]
    fn test_broad_filter_falls_back_to_full_scan() {
        let index = populated(IndexConfig::default());
        let hosts = ["host_0", "host_1", "host_2", "host_3", "host_4"];
        let plan = QueryPlanner::default()
            .plan(&query(&hosts), &index, 100, ScanPreference::Auto)
            .unwrap();

        assert_eq!(plan.strategy, ScanStrategy::FullScan);
        assert_eq!(plan.selectivity, Some(0.5));
        assert_eq!(plan.summary(), "COLLSCAN");

        let forced = QueryPlanner::default()
            .plan(&query(&hosts), &index, 100, ScanPreference::Index)
            .unwrap();
        assert!(forced.is_index_scan());
    }

    #[test]
    fn test_picks_most_selective_key() {
        let index = populated(IndexConfig::default());
        let query = QueryDescriptor::builder("cpu")
            .tag_eq("arch", "x64")
            .tag_eq("hostname", "host_4")
            .time_range(0, 100_000)
            .max("usage_user")
            .build();

        let plan = QueryPlanner::default()
            .plan(&query, &index, 100, ScanPreference::Auto)
            .unwrap();
        assert!(matches!(
            plan.strategy,
            ScanStrategy::IndexScan { ref tag_key, .. } if tag_key == "hostname"
        ));
    }

    #[test]
    fn test_unindexed_or_absent_filter_is_full_scan() {
        let index = populated(IndexConfig::only(["arch"]));
        let plan = QueryPlanner::default()
            .plan(&query(&["host_0"]), &index, 100, ScanPreference::Index)
            .unwrap();
        assert_eq!(plan.strategy, ScanStrategy::FullScan);
        assert_eq!(plan.selectivity, None);

        let unfiltered = QueryDescriptor::builder("cpu").max("usage_user").build();
        let plan = QueryPlanner::default()
            .plan(&unfiltered, &index, 100, ScanPreference::Auto)
            .unwrap();
        assert_eq!(plan.strategy, ScanStrategy::FullScan);
    }

    #[test]
    fn test_full_preference_wins() {
        let index = populated(IndexConfig::default());
        let plan = QueryPlanner::default()
            .plan(&query(&["host_0"]), &index, 42, ScanPreference::Full)
            .unwrap();
        assert_eq!(plan.strategy, ScanStrategy::FullScan);
        assert_eq!(plan.watermark, 42);
    }
}
