use crate::storage::entity::job::{self, ActiveModel as JobActiveModel, Entity as Job};
use crate::storage::entity::job_error::{self, ActiveModel as JobErrorActiveModel, Entity as JobError};
use crate::storage::entity::job_result::{
    self, ActiveModel as JobResultActiveModel, Entity as JobResult,
};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseBackend, DbErr, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Statement,
};

/// Single statement pop-and-mark: picks the best PENDING row and flips it to RUNNING.
/// The outer `status = 'PENDING'` re-check keeps the update conditional.
const LEASE_NEXT_SQL: &str = "UPDATE jobs \
     SET status = 'RUNNING', lease_owner = ?, lease_token = ?, lease_expires_at = ?, started_at = ?, updated_at = ? \
     WHERE id = (SELECT id FROM jobs WHERE status = 'PENDING' AND next_run_at <= ? \
                 ORDER BY priority ASC, created_at ASC, id ASC LIMIT 1) \
       AND status = 'PENDING' \
     RETURNING *";

const TOUCH_EXPIRED_SQL: &str = "UPDATE jobs SET updated_at = ? \
     WHERE status = 'RUNNING' AND lease_expires_at IS NOT NULL AND lease_expires_at < ? \
     RETURNING *";

const INSERT_CHUNK: usize = 200;

/// Column values written when a job leaves RUNNING.
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub status: &'static str,
    pub attempt_count: i32,
    pub next_run_at: i64,
    pub error_category: Option<String>,
    pub error_message: Option<String>,
    pub finished_at: Option<i64>,
}

pub struct JobRepository;

impl JobRepository {
    pub async fn insert_jobs<C: ConnectionTrait>(
        db: &C,
        jobs: Vec<JobActiveModel>,
    ) -> Result<u64, DbErr> {
        let mut inserted = 0u64;
        let mut rest = jobs;
        while !rest.is_empty() {
            let tail = rest.split_off(rest.len().min(INSERT_CHUNK));
            let chunk = std::mem::replace(&mut rest, tail);
            inserted += chunk.len() as u64;
            Job::insert_many(chunk).exec_without_returning(db).await?;
        }
        Ok(inserted)
    }

    pub async fn find<C: ConnectionTrait>(db: &C, id: i32) -> Result<Option<job::Model>, DbErr> {
        Job::find_by_id(id).one(db).await
    }

    pub async fn jobs_for_batch<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
    ) -> Result<Vec<job::Model>, DbErr> {
        Job::find()
            .filter(job::Column::BatchId.eq(batch_id))
            .order_by_asc(job::Column::Id)
            .all(db)
            .await
    }

    /// Atomic lease: returns the claimed row, already RUNNING under `lease_token`.
    pub async fn lease_next<C: ConnectionTrait>(
        db: &C,
        worker_id: &str,
        lease_token: &str,
        now: i64,
        lease_expires_at: i64,
    ) -> Result<Option<job::Model>, DbErr> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            LEASE_NEXT_SQL,
            [
                worker_id.into(),
                lease_token.into(),
                lease_expires_at.into(),
                now.into(),
                now.into(),
                now.into(),
            ],
        );
        Job::find().from_raw_sql(stmt).one(db).await
    }

    /// Extends the lease only while this exact lease still holds a RUNNING job.
    pub async fn extend_lease<C: ConnectionTrait>(
        db: &C,
        id: i32,
        worker_id: &str,
        lease_token: &str,
        lease_expires_at: i64,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Job::update_many()
            .col_expr(job::Column::LeaseExpiresAt, Expr::value(lease_expires_at))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(id))
            .filter(job::Column::Status.eq("RUNNING"))
            .filter(job::Column::LeaseOwner.eq(worker_id))
            .filter(job::Column::LeaseToken.eq(lease_token))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// First write of every ownership-checked transaction: also takes the write lock.
    pub async fn touch_owned<C: ConnectionTrait>(
        db: &C,
        id: i32,
        worker_id: &str,
        lease_token: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Job::update_many()
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(id))
            .filter(job::Column::Status.eq("RUNNING"))
            .filter(job::Column::LeaseOwner.eq(worker_id))
            .filter(job::Column::LeaseToken.eq(lease_token))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// RUNNING rows whose lease has lapsed, touched so the caller holds the write lock.
    pub async fn touch_expired<C: ConnectionTrait>(
        db: &C,
        now: i64,
    ) -> Result<Vec<job::Model>, DbErr> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Sqlite,
            TOUCH_EXPIRED_SQL,
            [now.into(), now.into()],
        );
        Job::find().from_raw_sql(stmt).all(db).await
    }

    pub async fn finish_success<C: ConnectionTrait>(
        db: &C,
        id: i32,
        status: &'static str,
        result_ref: Option<String>,
        now: i64,
    ) -> Result<(), DbErr> {
        Job::update_many()
            .col_expr(job::Column::Status, Expr::value(status))
            .col_expr(job::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LeaseToken, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(job::Column::ResultRef, Expr::value(result_ref))
            .col_expr(job::Column::ErrorCategory, Expr::value(Option::<String>::None))
            .col_expr(job::Column::ErrorMessage, Expr::value(Option::<String>::None))
            .col_expr(job::Column::FinishedAt, Expr::value(now))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(id))
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn apply_transition<C: ConnectionTrait>(
        db: &C,
        id: i32,
        transition: JobTransition,
        now: i64,
    ) -> Result<(), DbErr> {
        Job::update_many()
            .col_expr(job::Column::Status, Expr::value(transition.status))
            .col_expr(job::Column::AttemptCount, Expr::value(transition.attempt_count))
            .col_expr(job::Column::NextRunAt, Expr::value(transition.next_run_at))
            .col_expr(job::Column::LeaseOwner, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LeaseToken, Expr::value(Option::<String>::None))
            .col_expr(job::Column::LeaseExpiresAt, Expr::value(Option::<i64>::None))
            .col_expr(job::Column::ErrorCategory, Expr::value(transition.error_category))
            .col_expr(job::Column::ErrorMessage, Expr::value(transition.error_message))
            .col_expr(job::Column::FinishedAt, Expr::value(transition.finished_at))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// A requeued job's last failure is dropped: cancellation, not that error, ends it.
    pub async fn cancel_pending<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Job::update_many()
            .col_expr(job::Column::Status, Expr::value("CANCELLED"))
            .col_expr(job::Column::ErrorCategory, Expr::value(Option::<String>::None))
            .col_expr(job::Column::ErrorMessage, Expr::value(Option::<String>::None))
            .col_expr(job::Column::FinishedAt, Expr::value(now))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::BatchId.eq(batch_id))
            .filter(job::Column::Status.eq("PENDING"))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    /// RUNNING jobs are never interrupted; they only carry the flag to their next transition.
    pub async fn flag_running_cancelled<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Job::update_many()
            .col_expr(job::Column::CancelRequested, Expr::value(true))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::BatchId.eq(batch_id))
            .filter(job::Column::Status.eq("RUNNING"))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn status_counts<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
    ) -> Result<Vec<(String, i64)>, DbErr> {
        Job::find()
            .select_only()
            .column(job::Column::Status)
            .column_as(Expr::col(job::Column::Id).count(), "count")
            .filter(job::Column::BatchId.eq(batch_id))
            .group_by(job::Column::Status)
            .into_tuple::<(String, i64)>()
            .all(db)
            .await
    }

    /// Write-once per job; a retried attempt overwrites the previous row.
    pub async fn upsert_result<C: ConnectionTrait>(
        db: &C,
        result: JobResultActiveModel,
    ) -> Result<(), DbErr> {
        JobResult::insert(result)
            .on_conflict(
                OnConflict::column(job_result::Column::JobId)
                    .update_columns([
                        job_result::Column::Attempt,
                        job_result::Column::MetricsJson,
                        job_result::Column::ArtifactRef,
                        job_result::Column::DurationMs,
                        job_result::Column::RecordedAt,
                        job_result::Column::TrackedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(db)
            .await?;
        Ok(())
    }

    pub async fn results_for_batch<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
    ) -> Result<Vec<job_result::Model>, DbErr> {
        JobResult::find()
            .filter(job_result::Column::BatchId.eq(batch_id))
            .all(db)
            .await
    }

    pub async fn mark_tracked<C: ConnectionTrait>(
        db: &C,
        job_id: i32,
        now: i64,
    ) -> Result<(), DbErr> {
        JobResult::update_many()
            .col_expr(job_result::Column::TrackedAt, Expr::value(now))
            .filter(job_result::Column::JobId.eq(job_id))
            .exec(db)
            .await?;
        Ok(())
    }

    /// Ledger append; a duplicate `(job_id, attempt, category)` is silently skipped.
    pub async fn append_error<C: ConnectionTrait>(
        db: &C,
        entry: JobErrorActiveModel,
    ) -> Result<u64, DbErr> {
        JobError::insert(entry)
            .on_conflict(
                OnConflict::columns([
                    job_error::Column::JobId,
                    job_error::Column::Attempt,
                    job_error::Column::Category,
                ])
                .do_nothing()
                .to_owned(),
            )
            .exec_without_returning(db)
            .await
    }

    pub async fn errors_for_batch<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
    ) -> Result<Vec<job_error::Model>, DbErr> {
        JobError::find()
            .filter(job_error::Column::BatchId.eq(batch_id))
            .order_by_asc(job_error::Column::Id)
            .all(db)
            .await
    }
}
