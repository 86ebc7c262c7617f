pub mod transition;

pub use transition::{after_failure, after_success, FailureTransition, JobStatus, RetryPolicy};

use crate::backtest::model::{ErrorCategory, ExecutionRequest};
use crate::error::{OrchestratorError, Result};
use crate::storage::entity::{job, job_error, job_result};
use crate::storage::now_ms;
use crate::storage::repository::{JobRepository, JobTransition};
use log::{info, warn};
use sea_orm::{ConnectionTrait, DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub job_id: i32,
    pub batch_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: BTreeMap<String, Value>,
    pub start_date: String,
    pub end_date: String,
    pub priority: i32,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub lease_owner: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub cancel_requested: bool,
    pub created_at: i64,
    pub error_category: Option<ErrorCategory>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
}

impl TryFrom<job::Model> for Job {
    type Error = OrchestratorError;

    fn try_from(model: job::Model) -> Result<Self> {
        let job_id = model.id;
        let corrupt = |reason: String| OrchestratorError::CorruptRecord { job_id, reason };
        let parameters: BTreeMap<String, Value> = serde_json::from_str(&model.parameters_json)
            .map_err(|e| corrupt(format!("parameters: {}", e)))?;
        let status = model.status.parse::<JobStatus>().map_err(corrupt)?;
        let error_category = match model.error_category.as_deref() {
            Some(raw) => Some(raw.parse::<ErrorCategory>().map_err(corrupt)?),
            None => None,
        };

        Ok(Self {
            job_id: model.id,
            batch_id: model.batch_id,
            symbol: model.symbol,
            strategy_id: model.strategy_id,
            parameters,
            start_date: model.start_date,
            end_date: model.end_date,
            priority: model.priority,
            status,
            attempt_count: model.attempt_count,
            max_attempts: model.max_attempts,
            lease_owner: model.lease_owner,
            lease_token: model.lease_token,
            lease_expires_at: model.lease_expires_at,
            cancel_requested: model.cancel_requested,
            created_at: model.created_at,
            error_category,
            error_message: model.error_message,
            result_ref: model.result_ref,
        })
    }
}

impl Job {
    /// The handle `heartbeat`, `complete` and `fail` check against. Only a
    /// job returned by `JobQueue::lease` carries one.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.lease_owner, &self.lease_token) {
            (Some(worker_id), Some(token)) => Some(Lease {
                job_id: self.job_id,
                worker_id: worker_id.clone(),
                token: token.clone(),
            }),
            _ => None,
        }
    }

    pub fn execution_request(&self) -> ExecutionRequest {
        ExecutionRequest {
            job_id: self.job_id,
            symbol: self.symbol.clone(),
            strategy_id: self.strategy_id.clone(),
            parameters: self.parameters.clone(),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
        }
    }
}

/// One grant of a job to a worker. The token is minted per lease, so two
/// workers that happen to share an id never hold the same lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub job_id: i32,
    pub worker_id: String,
    pub token: String,
}

/// A job about to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub batch_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: BTreeMap<String, Value>,
    pub start_date: String,
    pub end_date: String,
    pub priority: i32,
    pub max_attempts: i32,
}

/// What a worker reports on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultRecord {
    pub metrics: BTreeMap<String, f64>,
    pub artifact_ref: Option<String>,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorLogEntry {
    pub job_id: i32,
    pub attempt: i32,
    pub category: String,
    pub message: String,
    pub worker_id: Option<String>,
    pub created_at: i64,
}

impl From<job_error::Model> for ErrorLogEntry {
    fn from(model: job_error::Model) -> Self {
        Self {
            job_id: model.job_id,
            attempt: model.attempt,
            category: model.category,
            message: model.message,
            worker_id: model.worker_id,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub requeued: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl ReclaimReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed + self.cancelled
    }
}

/// Durable priority queue over the `jobs` table. Cheap to clone; every clone
/// shares the same connection pool.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<DatabaseConnection>,
    retry: RetryPolicy,
}

impl JobQueue {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn db(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    /// Inserts all jobs in one transaction.
    pub async fn enqueue(&self, jobs: Vec<NewJob>) -> Result<u64> {
        let txn = self.db.begin().await?;
        let inserted = Self::enqueue_with(&txn, jobs, now_ms()).await?;
        txn.commit().await?;
        Ok(inserted)
    }

    /// Enqueue on a caller-owned connection or transaction. Jobs share `now` as
    /// `created_at`, so insertion order (the id) breaks priority ties.
    pub(crate) async fn enqueue_with<C: ConnectionTrait>(
        conn: &C,
        jobs: Vec<NewJob>,
        now: i64,
    ) -> Result<u64> {
        let mut models = Vec::with_capacity(jobs.len());
        for new_job in jobs {
            models.push(job::ActiveModel {
                batch_id: Set(new_job.batch_id),
                symbol: Set(new_job.symbol),
                strategy_id: Set(new_job.strategy_id),
                parameters_json: Set(serde_json::to_string(&new_job.parameters)?),
                start_date: Set(new_job.start_date),
                end_date: Set(new_job.end_date),
                priority: Set(new_job.priority),
                status: Set(JobStatus::Pending.as_str().to_string()),
                attempt_count: Set(1),
                max_attempts: Set(new_job.max_attempts.max(1)),
                next_run_at: Set(now),
                lease_owner: Set(None),
                lease_token: Set(None),
                lease_expires_at: Set(None),
                cancel_requested: Set(false),
                error_category: Set(None),
                error_message: Set(None),
                result_ref: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                started_at: Set(None),
                finished_at: Set(None),
                ..Default::default()
            });
        }
        Ok(JobRepository::insert_jobs(conn, models).await?)
    }

    /// Pops the best PENDING job and marks it RUNNING for `worker_id`, in one statement.
    pub async fn lease(&self, worker_id: &str, lease_duration: Duration) -> Result<Option<Job>> {
        let now = now_ms();
        let expires = now + lease_duration.as_millis() as i64;
        let token = uuid::Uuid::new_v4().to_string();
        match JobRepository::lease_next(self.db.as_ref(), worker_id, &token, now, expires).await? {
            Some(model) => Ok(Some(Job::try_from(model)?)),
            None => Ok(None),
        }
    }

    /// Pushes the lease deadline out by `lease_duration`. `LeaseLost` means the
    /// job was reclaimed, finished, or is now held under another lease.
    pub async fn heartbeat(&self, lease: &Lease, lease_duration: Duration) -> Result<()> {
        let now = now_ms();
        let expires = now + lease_duration.as_millis() as i64;
        let updated = JobRepository::extend_lease(
            self.db.as_ref(),
            lease.job_id,
            &lease.worker_id,
            &lease.token,
            expires,
            now,
        )
        .await?;
        if updated == 0 {
            return Err(lease_lost(lease));
        }
        Ok(())
    }

    /// Records the result and moves the job to SUCCEEDED (or CANCELLED when its
    /// batch was cancelled while it ran).
    pub async fn complete(&self, lease: &Lease, result: JobResultRecord) -> Result<JobStatus> {
        let job_id = lease.job_id;
        let txn = self.db.begin().await?;
        let now = now_ms();

        if JobRepository::touch_owned(&txn, job_id, &lease.worker_id, &lease.token, now).await? == 0 {
            txn.rollback().await?;
            return Err(lease_lost(lease));
        }
        let model = JobRepository::find(&txn, job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        let status = after_success(model.cancel_requested);
        JobRepository::finish_success(&txn, job_id, status.as_str(), result.artifact_ref.clone(), now)
            .await?;
        JobRepository::upsert_result(
            &txn,
            job_result::ActiveModel {
                job_id: Set(job_id),
                batch_id: Set(model.batch_id.clone()),
                attempt: Set(model.attempt_count),
                metrics_json: Set(serde_json::to_string(&result.metrics)?),
                artifact_ref: Set(result.artifact_ref),
                duration_ms: Set(result.duration_ms),
                recorded_at: Set(now),
                tracked_at: Set(None),
            },
        )
        .await?;
        txn.commit().await?;

        info!(
            "✓ job {} ({} / {}) {} on attempt {}",
            job_id, model.symbol, model.strategy_id, status, model.attempt_count
        );
        Ok(status)
    }

    /// Records a failed attempt. Returns the status the job moved to:
    /// PENDING (requeued), FAILED, or CANCELLED.
    pub async fn fail(
        &self,
        lease: &Lease,
        category: ErrorCategory,
        message: &str,
    ) -> Result<JobStatus> {
        let job_id = lease.job_id;
        let txn = self.db.begin().await?;
        let now = now_ms();

        if JobRepository::touch_owned(&txn, job_id, &lease.worker_id, &lease.token, now).await? == 0 {
            txn.rollback().await?;
            return Err(lease_lost(lease));
        }
        let model = JobRepository::find(&txn, job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;

        let status = self
            .record_failure(&txn, &model, category, message, Some(&lease.worker_id), now)
            .await?;
        txn.commit().await?;
        Ok(status)
    }

    pub async fn reclaim_expired(&self) -> Result<ReclaimReport> {
        self.reclaim_expired_at(now_ms()).await
    }

    /// Treats every RUNNING job whose lease lapsed before `now` as a crashed
    /// worker: requeue under the infra_error ceiling, otherwise FAILED.
    pub async fn reclaim_expired_at(&self, now: i64) -> Result<ReclaimReport> {
        let txn = self.db.begin().await?;
        let expired = JobRepository::touch_expired(&txn, now).await?;

        let mut report = ReclaimReport::default();
        for model in &expired {
            let owner = model.lease_owner.clone().unwrap_or_else(|| "?".to_string());
            let message = format!("lease expired while held by {}", owner);
            let status = self
                .record_failure(
                    &txn,
                    model,
                    ErrorCategory::InfraError,
                    &message,
                    model.lease_owner.as_deref(),
                    now,
                )
                .await?;
            match status {
                JobStatus::Pending => report.requeued += 1,
                JobStatus::Cancelled => report.cancelled += 1,
                _ => report.failed += 1,
            }
        }
        txn.commit().await?;

        if report.total() > 0 {
            warn!(
                "⚠ reclaimed {} expired leases (requeued {}, failed {}, cancelled {})",
                report.total(),
                report.requeued,
                report.failed,
                report.cancelled
            );
        }
        Ok(report)
    }

    /// Startup pass: anything left RUNNING with a lapsed lease by a previous
    /// process goes back through the reclaim path.
    pub async fn recover(&self) -> Result<ReclaimReport> {
        info!("running queue recovery sweep...");
        let report = self.reclaim_expired().await?;
        if report.total() == 0 {
            info!("no interrupted jobs found");
        } else {
            info!("✓ recovered {} interrupted jobs", report.total());
        }
        Ok(report)
    }

    pub async fn job(&self, job_id: i32) -> Result<Job> {
        let model = JobRepository::find(self.db.as_ref(), job_id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(job_id))?;
        Job::try_from(model)
    }

    pub async fn jobs_for_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
        JobRepository::jobs_for_batch(self.db.as_ref(), batch_id)
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    pub async fn error_log(&self, batch_id: &str) -> Result<Vec<ErrorLogEntry>> {
        Ok(JobRepository::errors_for_batch(self.db.as_ref(), batch_id)
            .await?
            .into_iter()
            .map(ErrorLogEntry::from)
            .collect())
    }

    async fn record_failure<C: ConnectionTrait>(
        &self,
        conn: &C,
        model: &job::Model,
        category: ErrorCategory,
        message: &str,
        worker_id: Option<&str>,
        now: i64,
    ) -> Result<JobStatus> {
        let transition = after_failure(
            model.attempt_count,
            model.max_attempts,
            model.cancel_requested,
            category,
        );
        let columns = match transition {
            FailureTransition::Requeue { next_attempt } => JobTransition {
                status: JobStatus::Pending.as_str(),
                attempt_count: next_attempt,
                next_run_at: now + self.retry.delay_for(next_attempt).as_millis() as i64,
                error_category: Some(category.as_str().to_string()),
                error_message: Some(message.to_string()),
                finished_at: None,
            },
            FailureTransition::Fail | FailureTransition::Cancel => JobTransition {
                status: transition.status().as_str(),
                attempt_count: model.attempt_count,
                next_run_at: model.next_run_at,
                error_category: Some(category.as_str().to_string()),
                error_message: Some(message.to_string()),
                finished_at: Some(now),
            },
        };
        JobRepository::apply_transition(conn, model.id, columns, now).await?;
        JobRepository::append_error(
            conn,
            job_error::ActiveModel {
                batch_id: Set(model.batch_id.clone()),
                job_id: Set(model.id),
                attempt: Set(model.attempt_count),
                category: Set(category.as_str().to_string()),
                message: Set(message.to_string()),
                worker_id: Set(worker_id.map(str::to_string)),
                created_at: Set(now),
                ..Default::default()
            },
        )
        .await?;

        let status = transition.status();
        match transition {
            FailureTransition::Requeue { next_attempt } => warn!(
                "⚠ job {} requeued [{}/{}] after {}: {}",
                model.id, next_attempt, model.max_attempts, category, message
            ),
            _ => warn!(
                "✗ job {} {} after attempt {} ({}): {}",
                model.id, status, model.attempt_count, category, message
            ),
        }
        Ok(status)
    }
}

fn lease_lost(lease: &Lease) -> OrchestratorError {
    OrchestratorError::LeaseLost {
        job_id: lease.job_id,
        worker_id: lease.worker_id.clone(),
    }
}
