pub mod priority;

pub use priority::PriorityRules;

use crate::error::{OrchestratorError, Result};
use crate::queue::{ErrorLogEntry, JobQueue, JobStatus, NewJob};
use crate::storage::entity::batch;
use crate::storage::now_ms;
use crate::storage::repository::{BatchRepository, JobRepository};
use chrono::NaiveDate;
use log::info;
use sea_orm::{DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// A symbol × strategy × parameter-set matrix to backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub symbols: Vec<String>,
    pub strategies: Vec<String>,
    pub parameter_sets: Vec<BTreeMap<String, Value>>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_attempts: i32,
}

/// One cell of the matrix, as seen by the priority function.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSpec {
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub cancelled_at: Option<i64>,
}

impl BatchStatus {
    pub fn is_complete(&self) -> bool {
        self.succeeded + self.failed + self.cancelled == self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaitOutcome {
    pub status: BatchStatus,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelReport {
    /// PENDING jobs moved to CANCELLED.
    pub cancelled: u64,
    /// RUNNING jobs left to finish; their results will be discarded.
    pub in_flight: u64,
}

pub struct Orchestrator {
    db: Arc<DatabaseConnection>,
    queue: JobQueue,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            db: queue.db().clone(),
            queue,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Cartesian product in submission order: symbols, then strategies, then parameter sets.
    pub fn expand(request: &BatchRequest) -> Vec<JobSpec> {
        let mut specs = Vec::with_capacity(
            request.symbols.len() * request.strategies.len() * request.parameter_sets.len(),
        );
        for symbol in &request.symbols {
            for strategy in &request.strategies {
                for params in &request.parameter_sets {
                    specs.push(JobSpec {
                        symbol: symbol.clone(),
                        strategy_id: strategy.clone(),
                        parameters: params.clone(),
                    });
                }
            }
        }
        specs
    }

    /// Expands the matrix and enqueues every job together with the batch row
    /// in a single transaction: either the whole batch is visible or none of it.
    pub async fn submit_batch<F>(&self, request: BatchRequest, priority_fn: F) -> Result<String>
    where
        F: Fn(&JobSpec) -> i32,
    {
        validate(&request)?;

        let batch_id = uuid::Uuid::new_v4().to_string();
        let start_date = request.start_date.to_string();
        let end_date = request.end_date.to_string();
        let jobs: Vec<NewJob> = Self::expand(&request)
            .into_iter()
            .map(|spec| {
                let priority = priority_fn(&spec);
                NewJob {
                    batch_id: batch_id.clone(),
                    symbol: spec.symbol,
                    strategy_id: spec.strategy_id,
                    parameters: spec.parameters,
                    start_date: start_date.clone(),
                    end_date: end_date.clone(),
                    priority,
                    max_attempts: request.max_attempts,
                }
            })
            .collect();
        let total = jobs.len();

        let now = now_ms();
        let txn = self.db.begin().await?;
        BatchRepository::insert(
            &txn,
            batch::ActiveModel {
                batch_id: Set(batch_id.clone()),
                total_jobs: Set(total as i32),
                start_date: Set(start_date),
                end_date: Set(end_date),
                created_at: Set(now),
                completed_at: Set(None),
                cancelled_at: Set(None),
                consolidated_at: Set(None),
                archived_at: Set(None),
            },
        )
        .await?;
        JobQueue::enqueue_with(&txn, jobs, now).await?;
        txn.commit().await?;

        info!(
            "▶ batch {} submitted: {} symbols × {} strategies × {} parameter sets = {} jobs",
            batch_id,
            request.symbols.len(),
            request.strategies.len(),
            request.parameter_sets.len(),
            total
        );
        Ok(batch_id)
    }

    /// Point-in-time counts, derived from the job rows.
    pub async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let batch = BatchRepository::find(self.db.as_ref(), batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::BatchNotFound(batch_id.to_string()))?;

        let mut status = BatchStatus {
            batch_id: batch.batch_id.clone(),
            created_at: batch.created_at,
            completed_at: batch.completed_at,
            cancelled_at: batch.cancelled_at,
            ..Default::default()
        };
        for (raw, count) in JobRepository::status_counts(self.db.as_ref(), batch_id).await? {
            let count = count as usize;
            status.total += count;
            match raw.parse::<JobStatus>() {
                Ok(JobStatus::Pending) => status.pending += count,
                Ok(JobStatus::Running) => status.running += count,
                Ok(JobStatus::Succeeded) => status.succeeded += count,
                Ok(JobStatus::Failed) => status.failed += count,
                Ok(JobStatus::Cancelled) => status.cancelled += count,
                Err(reason) => {
                    return Err(OrchestratorError::CorruptRecord { job_id: 0, reason });
                }
            }
        }

        if status.is_complete() && status.completed_at.is_none() {
            let now = now_ms();
            if BatchRepository::mark_completed(self.db.as_ref(), batch_id, now).await? > 0 {
                info!(
                    "✓ batch {} complete: {} succeeded, {} failed, {} cancelled",
                    batch_id, status.succeeded, status.failed, status.cancelled
                );
            }
            status.completed_at = Some(now);
        }
        Ok(status)
    }

    /// Polls until the batch is complete or `timeout` elapses. Never blocks past
    /// the deadline; on timeout the latest snapshot comes back with `timed_out`.
    pub async fn wait_for_batch(&self, batch_id: &str, timeout: Duration) -> Result<WaitOutcome> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.get_batch_status(batch_id).await?;
            if status.is_complete() {
                return Ok(WaitOutcome {
                    status,
                    timed_out: false,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome {
                    status,
                    timed_out: true,
                });
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Cooperative cancellation: PENDING jobs become CANCELLED now, RUNNING jobs
    /// are flagged and end as CANCELLED when they next report.
    pub async fn cancel_batch(&self, batch_id: &str) -> Result<CancelReport> {
        let txn = self.db.begin().await?;
        let now = now_ms();
        if BatchRepository::mark_cancelled(&txn, batch_id, now).await? == 0
            && BatchRepository::find(&txn, batch_id).await?.is_none()
        {
            txn.rollback().await?;
            return Err(OrchestratorError::BatchNotFound(batch_id.to_string()));
        }
        let cancelled = JobRepository::cancel_pending(&txn, batch_id, now).await?;
        let in_flight = JobRepository::flag_running_cancelled(&txn, batch_id, now).await?;
        txn.commit().await?;

        info!(
            "batch {} cancelled: {} pending jobs cancelled, {} still running",
            batch_id, cancelled, in_flight
        );
        Ok(CancelReport {
            cancelled,
            in_flight,
        })
    }

    pub async fn error_log(&self, batch_id: &str) -> Result<Vec<ErrorLogEntry>> {
        self.queue.error_log(batch_id).await
    }

    /// Marks a complete, consolidated batch as archived. Rows are kept.
    pub async fn archive_batch(&self, batch_id: &str) -> Result<()> {
        let status = self.get_batch_status(batch_id).await?;
        let batch = BatchRepository::find(self.db.as_ref(), batch_id)
            .await?
            .ok_or_else(|| OrchestratorError::BatchNotFound(batch_id.to_string()))?;
        if !status.is_complete() || batch.consolidated_at.is_none() {
            return Err(OrchestratorError::NotArchivable(batch_id.to_string()));
        }
        BatchRepository::mark_archived(self.db.as_ref(), batch_id, now_ms()).await?;
        info!("batch {} archived", batch_id);
        Ok(())
    }
}

fn validate(request: &BatchRequest) -> Result<()> {
    let invalid = |msg: &str| Err(OrchestratorError::InvalidRequest(msg.to_string()));
    if request.symbols.is_empty() {
        return invalid("no symbols");
    }
    if request.strategies.is_empty() {
        return invalid("no strategies");
    }
    if request.parameter_sets.is_empty() {
        return invalid("no parameter sets");
    }
    if request
        .symbols
        .iter()
        .chain(request.strategies.iter())
        .any(|s| s.trim().is_empty())
    {
        return invalid("blank symbol or strategy id");
    }
    if request.start_date > request.end_date {
        return invalid("start_date is after end_date");
    }
    if request.max_attempts < 1 {
        return invalid("max_attempts must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BatchRequest {
        let mut fast = BTreeMap::new();
        fast.insert("window".to_string(), Value::from(10));
        let mut slow = BTreeMap::new();
        slow.insert("window".to_string(), Value::from(50));
        BatchRequest {
            symbols: vec!["SPY".into(), "QQQ".into()],
            strategies: vec!["sma_cross".into(), "breakout".into(), "rsi".into()],
            parameter_sets: vec![fast, slow],
            start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            max_attempts: 3,
        }
    }

    #[test]
    fn test_expand_is_full_cartesian_product_in_order() {
        let specs = Orchestrator::expand(&request());
        assert_eq!(specs.len(), 12);
        assert_eq!(specs[0].symbol, "SPY");
        assert_eq!(specs[0].strategy_id, "sma_cross");
        assert_eq!(specs[1].parameters["window"], Value::from(50));
        assert_eq!(specs[2].strategy_id, "breakout");
        assert_eq!(specs[6].symbol, "QQQ");
    }

    #[test]
    fn test_validate_rejects_empty_axes_and_bad_dates() {
        assert!(validate(&request()).is_ok());

        let mut r = request();
        r.symbols.clear();
        assert!(matches!(validate(&r), Err(OrchestratorError::InvalidRequest(_))));

        let mut r = request();
        r.parameter_sets.clear();
        assert!(validate(&r).is_err());

        let mut r = request();
        r.start_date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert!(validate(&r).is_err());

        let mut r = request();
        r.max_attempts = 0;
        assert!(validate(&r).is_err());
    }

    #[test]
    fn test_batch_status_completion() {
        let mut status = BatchStatus {
            total: 4,
            succeeded: 2,
            failed: 1,
            running: 1,
            ..Default::default()
        };
        assert!(!status.is_complete());
        status.running = 0;
        status.cancelled = 1;
        assert!(status.is_complete());
    }
}
