use crate::backtest::model::REQUIRED_METRICS;
use crate::consolidate::table::ConsolidatedTable;
use crate::queue::JobStatus;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BestMetric {
    pub job_id: i32,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// failed / total
    pub failure_rate: f64,
    pub median_duration_ms: Option<i64>,
    pub best: BTreeMap<String, BestMetric>,
    pub error_counts: BTreeMap<String, usize>,
}

/// Drawdown is a loss magnitude, so lower wins.
fn lower_is_better(metric: &str) -> bool {
    metric == "max_drawdown"
}

impl ConsolidatedTable {
    pub fn summary(&self) -> BatchSummary {
        let total = self.rows.len();
        let count = |s: JobStatus| self.rows.iter().filter(|r| r.status == s).count();
        let failed = count(JobStatus::Failed);

        let mut best: BTreeMap<String, BestMetric> = BTreeMap::new();
        for row in &self.rows {
            let Some(metrics) = &row.metrics else { continue };
            for name in REQUIRED_METRICS {
                let Some(value) = metrics.get(name).filter(|v| v.is_finite()) else {
                    continue;
                };
                let better = match best.get(name) {
                    None => true,
                    Some(cur) if lower_is_better(name) => value < cur.value,
                    Some(cur) => value > cur.value,
                };
                if better {
                    best.insert(
                        name.to_string(),
                        BestMetric {
                            job_id: row.job_id,
                            value,
                        },
                    );
                }
            }
        }

        let mut durations: Vec<i64> = self
            .rows
            .iter()
            .filter(|r| r.metrics.is_some())
            .filter_map(|r| r.duration_ms)
            .collect();
        durations.sort_unstable();

        let mut error_counts = BTreeMap::new();
        for category in self.rows.iter().filter_map(|r| r.error_category.as_ref()) {
            *error_counts.entry(category.clone()).or_insert(0) += 1;
        }

        BatchSummary {
            batch_id: self.batch_id.clone(),
            total,
            succeeded: count(JobStatus::Succeeded),
            failed,
            cancelled: count(JobStatus::Cancelled),
            failure_rate: if total == 0 {
                0.0
            } else {
                failed as f64 / total as f64
            },
            median_duration_ms: median(&durations),
            best,
            error_counts,
        }
    }
}

fn median(sorted: &[i64]) -> Option<i64> {
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[n / 2]),
        n => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2),
    }
}
