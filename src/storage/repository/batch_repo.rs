use crate::storage::entity::batch::{self, ActiveModel as BatchActiveModel, Entity as Batch};
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter};

pub struct BatchRepository;

impl BatchRepository {
    pub async fn insert<C: ConnectionTrait>(db: &C, batch: BatchActiveModel) -> Result<(), DbErr> {
        Batch::insert(batch).exec_without_returning(db).await?;
        Ok(())
    }

    pub async fn find<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
    ) -> Result<Option<batch::Model>, DbErr> {
        Batch::find_by_id(batch_id.to_string()).one(db).await
    }

    /// Stamps `completed_at` once; later calls are no-ops.
    pub async fn mark_completed<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Batch::update_many()
            .col_expr(batch::Column::CompletedAt, Expr::value(now))
            .filter(batch::Column::BatchId.eq(batch_id))
            .filter(batch::Column::CompletedAt.is_null())
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn mark_cancelled<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Batch::update_many()
            .col_expr(batch::Column::CancelledAt, Expr::value(now))
            .filter(batch::Column::BatchId.eq(batch_id))
            .filter(batch::Column::CancelledAt.is_null())
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }

    pub async fn mark_consolidated<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
        now: i64,
    ) -> Result<(), DbErr> {
        Batch::update_many()
            .col_expr(batch::Column::ConsolidatedAt, Expr::value(now))
            .filter(batch::Column::BatchId.eq(batch_id))
            .exec(db)
            .await?;
        Ok(())
    }

    pub async fn mark_archived<C: ConnectionTrait>(
        db: &C,
        batch_id: &str,
        now: i64,
    ) -> Result<u64, DbErr> {
        let res = Batch::update_many()
            .col_expr(batch::Column::ArchivedAt, Expr::value(now))
            .filter(batch::Column::BatchId.eq(batch_id))
            .filter(batch::Column::ArchivedAt.is_null())
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }
}
