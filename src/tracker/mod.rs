pub mod mlflow;

pub use mlflow::MlflowTracker;

use async_trait::async_trait;
use log::info;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// One successful job as handed to an experiment tracker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedRun {
    pub batch_id: String,
    pub job_id: i32,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: BTreeMap<String, Value>,
    pub metrics: BTreeMap<String, f64>,
    pub artifact_ref: Option<String>,
    pub duration_ms: i64,
}

impl TrackedRun {
    pub fn run_name(&self) -> String {
        format!("{}-{}-{}", self.strategy_id, self.symbol, self.job_id)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {
    #[error("missing env {0}")]
    MissingEnv(&'static str),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ExperimentTracker: Send + Sync {
    async fn log_run(&self, run: &TrackedRun) -> Result<(), TrackerError>;
}

/// Default tracker: the run goes to the log and nowhere else.
#[derive(Debug, Clone, Default)]
pub struct LogTracker;

#[async_trait]
impl ExperimentTracker for LogTracker {
    async fn log_run(&self, run: &TrackedRun) -> Result<(), TrackerError> {
        let sharpe = run.metrics.get("sharpe_ratio").copied().unwrap_or(f64::NAN);
        info!(
            "▶ run {} [{}] sharpe={:.3} duration={}ms",
            run.run_name(),
            run.batch_id,
            sharpe,
            run.duration_ms
        );
        Ok(())
    }
}
