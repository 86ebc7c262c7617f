use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Error ledger: one row per failed attempt, quarantined result or discarded result.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "job_errors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub batch_id: String,
    pub job_id: i32,
    pub attempt: i32,
    pub category: String,
    pub message: String,
    pub worker_id: Option<String>,
    pub created_at: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
