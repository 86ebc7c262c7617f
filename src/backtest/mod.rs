pub mod executor;
pub mod model;
pub mod service;
pub mod worker;

pub use executor::{BacktestExecutor, SubprocessExecutor, TaskIsolated};
pub use model::{ErrorCategory, ExecutionError, ExecutionOutput, ExecutionRequest, Metrics};
pub use service::WorkerPool;
pub use worker::{JobOutcome, Worker, WorkerConfig};
