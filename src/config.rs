use crate::backtest::WorkerConfig;
use crate::queue::RetryPolicy;
use crate::tracker::{ExperimentTracker, LogTracker, MlflowTracker};
use log::warn;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Process settings, read once from `.env` plus the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub workers: usize,
    pub lease_secs: u64,
    pub heartbeat_secs: u64,
    pub max_attempts: i32,
    pub job_timeout_secs: Option<u64>,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub reap_secs: u64,
    pub executor_cmd: Option<String>,
    pub mlflow_tracking_uri: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://backtests.db?mode=rwc".to_string(),
            workers: 4,
            lease_secs: 60,
            heartbeat_secs: 20,
            max_attempts: 3,
            job_timeout_secs: None,
            retry_base_ms: 0,
            retry_max_ms: 60_000,
            reap_secs: 5,
            executor_cmd: None,
            mlflow_tracking_uri: None,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("⚠ {}={} is not valid, using default", key, raw);
            default
        }),
        None => default,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(d.database_url),
            workers: env_parse("ORCH_WORKERS", d.workers).max(1),
            lease_secs: env_parse("ORCH_LEASE_SECS", d.lease_secs).max(1),
            heartbeat_secs: env_parse("ORCH_HEARTBEAT_SECS", d.heartbeat_secs).max(1),
            max_attempts: env_parse("ORCH_MAX_ATTEMPTS", d.max_attempts).max(1),
            job_timeout_secs: env_string("ORCH_JOB_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            retry_base_ms: env_parse("ORCH_RETRY_BASE_MS", d.retry_base_ms),
            retry_max_ms: env_parse("ORCH_RETRY_MAX_MS", d.retry_max_ms),
            reap_secs: env_parse("ORCH_REAP_SECS", d.reap_secs).max(1),
            executor_cmd: env_string("ORCH_EXECUTOR_CMD"),
            mlflow_tracking_uri: env_string("MLFLOW_TRACKING_URI"),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let lease = Duration::from_secs(self.lease_secs);
        let mut heartbeat = Duration::from_secs(self.heartbeat_secs);
        if heartbeat >= lease {
            warn!(
                "⚠ heartbeat interval {:?} is not shorter than lease {:?}, using lease/3",
                heartbeat, lease
            );
            heartbeat = lease / 3;
        }
        WorkerConfig {
            lease_duration: lease,
            heartbeat_interval: heartbeat,
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
            ..WorkerConfig::default()
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        if self.retry_base_ms == 0 {
            RetryPolicy::immediate()
        } else {
            RetryPolicy::exponential(
                Duration::from_millis(self.retry_base_ms),
                Duration::from_millis(self.retry_max_ms.max(self.retry_base_ms)),
            )
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_secs)
    }

    /// MLflow when `MLFLOW_TRACKING_URI` is set, otherwise the log tracker.
    pub fn tracker(&self) -> Arc<dyn ExperimentTracker> {
        match &self.mlflow_tracking_uri {
            Some(_) => match MlflowTracker::from_env() {
                Ok(t) => Arc::new(t),
                Err(e) => {
                    warn!("⚠ MLflow tracker unavailable ({}), falling back to log", e);
                    Arc::new(LogTracker)
                }
            },
            None => Arc::new(LogTracker),
        }
    }
}
