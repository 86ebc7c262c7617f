use sea_orm::DbErr;

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("database error: {0}")]
    Db(#[from] DbErr),
    #[error("job {job_id} is no longer leased by {worker_id}")]
    LeaseLost { job_id: i32, worker_id: String },
    #[error("job {0} not found")]
    JobNotFound(i32),
    #[error("batch {0} not found")]
    BatchNotFound(String),
    #[error("invalid batch request: {0}")]
    InvalidRequest(String),
    #[error("batch {0} must be complete and consolidated before archiving")]
    NotArchivable(String),
    #[error("corrupt job record {job_id}: {reason}")]
    CorruptRecord { job_id: i32, reason: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
