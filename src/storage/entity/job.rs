use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Deserialize, Serialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub batch_id: String,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters_json: String, // JSON object, keys sorted
    pub start_date: String,
    pub end_date: String,
    pub priority: i32,
    pub status: String, // PENDING/RUNNING/SUCCEEDED/FAILED/CANCELLED
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub next_run_at: i64,
    pub lease_owner: Option<String>,
    pub lease_token: Option<String>, // fresh per lease
    pub lease_expires_at: Option<i64>,
    pub cancel_requested: bool,
    pub error_category: Option<String>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
