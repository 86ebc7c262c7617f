pub mod summary;
pub mod table;

pub use summary::{BatchSummary, BestMetric};
pub use table::{ConsolidatedTable, ExportFormat, ResultRow};

use crate::backtest::model::{ErrorCategory, Metrics};
use crate::error::Result;
use crate::orchestrator::{Orchestrator, WaitOutcome};
use crate::queue::{ErrorLogEntry, Job, JobStatus};
use crate::storage::entity::{job_error, job_result};
use crate::storage::now_ms;
use crate::storage::repository::{BatchRepository, JobRepository};
use crate::tracker::{ExperimentTracker, TrackedRun};
use log::{info, warn};
use sea_orm::{DatabaseConnection, Set};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Turns a batch's job rows and stored results into one table, forwarding
/// each good result to the experiment tracker exactly once.
pub struct Consolidator {
    orchestrator: Orchestrator,
    tracker: Arc<dyn ExperimentTracker>,
}

impl Consolidator {
    pub fn new(orchestrator: Orchestrator, tracker: Arc<dyn ExperimentTracker>) -> Self {
        Self {
            orchestrator,
            tracker,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    fn db(&self) -> &DatabaseConnection {
        self.orchestrator.queue().db().as_ref()
    }

    /// Waits up to `timeout` for the batch, then consolidates whatever is there.
    pub async fn consolidate_when_complete(
        &self,
        batch_id: &str,
        timeout: Duration,
    ) -> Result<(WaitOutcome, ConsolidatedTable)> {
        let outcome = self.orchestrator.wait_for_batch(batch_id, timeout).await?;
        if outcome.timed_out {
            warn!(
                "⚠ batch {} not complete after {:?} ({} pending, {} running); consolidating partial view",
                batch_id, timeout, outcome.status.pending, outcome.status.running
            );
        }
        let table = self.consolidate(batch_id).await?;
        Ok((outcome, table))
    }

    /// Safe to call before completion (partial view) and to call repeatedly.
    pub async fn consolidate(&self, batch_id: &str) -> Result<ConsolidatedTable> {
        let status = self.orchestrator.get_batch_status(batch_id).await?;
        let jobs = self.orchestrator.queue().jobs_for_batch(batch_id).await?;
        let mut results: HashMap<i32, job_result::Model> =
            JobRepository::results_for_batch(self.db(), batch_id)
                .await?
                .into_iter()
                .map(|r| (r.job_id, r))
                .collect();

        let mut rows = Vec::with_capacity(jobs.len());
        let mut quarantined = Vec::new();
        let mut tracked = 0usize;

        for job in jobs {
            let stored = results.remove(&job.job_id);
            let mut row = base_row(&job);

            match (job.status, stored) {
                (JobStatus::Succeeded, Some(result)) => match parse_metrics(&result.metrics_json) {
                    Ok(metrics) => {
                        row.duration_ms = Some(result.duration_ms);
                        row.artifact_ref = result.artifact_ref.clone();
                        row.metrics = Some(metrics);
                        if result.tracked_at.is_none() && self.forward(batch_id, &job, &result, &metrics).await? {
                            tracked += 1;
                        }
                    }
                    Err(reason) => {
                        let entry = self.quarantine(&job, &reason).await?;
                        mark_malformed(&mut row, &reason);
                        quarantined.push(entry);
                    }
                },
                (JobStatus::Succeeded, None) => {
                    let reason = "job succeeded but no result was stored".to_string();
                    let entry = self.quarantine(&job, &reason).await?;
                    mark_malformed(&mut row, &reason);
                    quarantined.push(entry);
                }
                (JobStatus::Cancelled, Some(_)) => {
                    self.record(
                        &job,
                        ErrorCategory::Cancelled,
                        "result discarded: batch was cancelled while the job ran",
                    )
                    .await?;
                }
                _ => {}
            }
            rows.push(row);
        }

        if status.is_complete() {
            BatchRepository::mark_consolidated(self.db(), batch_id, now_ms()).await?;
        }
        info!(
            "✓ consolidated batch {}: {} rows, {} quarantined, {} forwarded to tracker",
            batch_id,
            rows.len(),
            quarantined.len(),
            tracked
        );

        Ok(ConsolidatedTable {
            batch_id: batch_id.to_string(),
            rows,
            quarantined,
        })
    }

    pub async fn export(&self, batch_id: &str, format: ExportFormat) -> Result<String> {
        self.consolidate(batch_id).await?.export(format)
    }

    pub async fn summary(&self, batch_id: &str) -> Result<BatchSummary> {
        Ok(self.consolidate(batch_id).await?.summary())
    }

    /// Tracker failures are logged and leave `tracked_at` unset for the next pass.
    async fn forward(
        &self,
        batch_id: &str,
        job: &Job,
        result: &job_result::Model,
        metrics: &Metrics,
    ) -> Result<bool> {
        let run = TrackedRun {
            batch_id: batch_id.to_string(),
            job_id: job.job_id,
            symbol: job.symbol.clone(),
            strategy_id: job.strategy_id.clone(),
            parameters: job.parameters.clone(),
            metrics: metrics.to_map(),
            artifact_ref: result.artifact_ref.clone(),
            duration_ms: result.duration_ms,
        };
        match self.tracker.log_run(&run).await {
            Ok(()) => {
                JobRepository::mark_tracked(self.db(), job.job_id, now_ms()).await?;
                Ok(true)
            }
            Err(e) => {
                warn!("⚠ tracker rejected job {}: {}", job.job_id, e);
                Ok(false)
            }
        }
    }

    async fn quarantine(&self, job: &Job, reason: &str) -> Result<ErrorLogEntry> {
        warn!("⚠ quarantined result of job {}: {}", job.job_id, reason);
        self.record(job, ErrorCategory::MalformedResult, reason).await
    }

    async fn record(&self, job: &Job, category: ErrorCategory, message: &str) -> Result<ErrorLogEntry> {
        let now = now_ms();
        JobRepository::append_error(
            self.db(),
            job_error::ActiveModel {
                batch_id: Set(job.batch_id.clone()),
                job_id: Set(job.job_id),
                attempt: Set(job.attempt_count),
                category: Set(category.as_str().to_string()),
                message: Set(message.to_string()),
                worker_id: Set(None),
                created_at: Set(now),
                ..Default::default()
            },
        )
        .await?;
        Ok(ErrorLogEntry {
            job_id: job.job_id,
            attempt: job.attempt_count,
            category: category.as_str().to_string(),
            message: message.to_string(),
            worker_id: None,
            created_at: now,
        })
    }
}

fn base_row(job: &Job) -> ResultRow {
    ResultRow {
        job_id: job.job_id,
        symbol: job.symbol.clone(),
        strategy_id: job.strategy_id.clone(),
        parameters: job.parameters.clone(),
        status: job.status,
        attempt_count: job.attempt_count,
        duration_ms: None,
        error_category: job.error_category.map(|c| c.as_str().to_string()),
        error_message: job.error_message.clone(),
        metrics: None,
        artifact_ref: None,
    }
}

fn mark_malformed(row: &mut ResultRow, reason: &str) {
    row.error_category = Some(ErrorCategory::MalformedResult.as_str().to_string());
    row.error_message = Some(reason.to_string());
}

fn parse_metrics(raw: &str) -> std::result::Result<Metrics, String> {
    let map: BTreeMap<String, f64> =
        serde_json::from_str(raw).map_err(|e| format!("unreadable metrics: {}", e))?;
    Metrics::from_map(&map).map_err(|missing| format!("missing metrics: {}", missing.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_metrics_reports_missing_fields() {
        let err = parse_metrics(r#"{"sharpe_ratio": 1.0, "win_rate": 0.5}"#).unwrap_err();
        assert!(err.starts_with("missing metrics: sortino_ratio, max_drawdown"));
        assert!(parse_metrics("not json").unwrap_err().starts_with("unreadable"));
    }
}
