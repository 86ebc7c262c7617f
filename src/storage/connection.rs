use crate::storage::entity::{batch, job, job_error, job_result};
use log::info;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection, DbErr, Schema,
    Statement,
};
use std::time::Duration;

const INDEXES: [&str; 4] = [
    // lease scan: status, then (priority, created_at, id)
    "CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(status, priority, created_at, id);",
    "CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs(batch_id, status);",
    "CREATE INDEX IF NOT EXISTS idx_job_results_batch ON job_results(batch_id);",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_job_errors_unique ON job_errors(job_id, attempt, category);",
];

pub async fn establish_connection(db_url: &str) -> Result<DatabaseConnection, DbErr> {
    let mut opt = ConnectOptions::new(db_url.to_owned());
    opt.max_connections(10)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    // WAL: readers never block the single writer
    db.execute(Statement::from_string(
        DatabaseBackend::Sqlite,
        "PRAGMA journal_mode=WAL;".to_string(),
    ))
    .await?;

    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    let stmt = builder.build(schema.create_table_from_entity(batch::Entity).if_not_exists());
    db.execute(stmt).await?;

    let stmt = builder.build(schema.create_table_from_entity(job::Entity).if_not_exists());
    db.execute(stmt).await?;

    let stmt = builder.build(
        schema
            .create_table_from_entity(job_result::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;

    let stmt = builder.build(
        schema
            .create_table_from_entity(job_error::Entity)
            .if_not_exists(),
    );
    db.execute(stmt).await?;

    for sql in INDEXES {
        db.execute(Statement::from_string(builder, sql.to_string()))
            .await?;
    }

    info!("Database connection established with WAL mode and tables initialized.");

    Ok(db)
}
