use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metric names every well-formed result must carry.
pub const REQUIRED_METRICS: [&str; 7] = [
    "sharpe_ratio",
    "sortino_ratio",
    "max_drawdown",
    "win_rate",
    "profit_factor",
    "trade_count",
    "avg_trade_return",
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    DataUnavailable, // symbol/date range has no data (not retryable)
    ExecutionError,  // computation raised (retried once)
    Timeout,         // wall-clock budget exceeded (retryable)
    InfraError,      // queue/network/worker crash, lease expiry (retryable)
    MalformedResult, // success reported without the required metrics
    Cancelled,       // result discarded because the batch was cancelled
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::DataUnavailable => "data_unavailable",
            ErrorCategory::ExecutionError => "execution_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::InfraError => "infra_error",
            ErrorCategory::MalformedResult => "malformed_result",
            ErrorCategory::Cancelled => "cancelled",
        }
    }

    /// Highest attempt number at which a failure in this category is still requeued.
    pub fn attempt_ceiling(&self, max_attempts: i32) -> i32 {
        match self {
            ErrorCategory::DataUnavailable
            | ErrorCategory::MalformedResult
            | ErrorCategory::Cancelled => 1,
            ErrorCategory::ExecutionError => max_attempts.min(2),
            ErrorCategory::Timeout | ErrorCategory::InfraError => max_attempts,
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ExecutionError | ErrorCategory::Timeout | ErrorCategory::InfraError
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data_unavailable" => Ok(ErrorCategory::DataUnavailable),
            "execution_error" => Ok(ErrorCategory::ExecutionError),
            "timeout" => Ok(ErrorCategory::Timeout),
            "infra_error" => Ok(ErrorCategory::InfraError),
            "malformed_result" => Ok(ErrorCategory::MalformedResult),
            "cancelled" => Ok(ErrorCategory::Cancelled),
            other => Err(format!("unknown error category: {}", other)),
        }
    }
}

/// Classified failure raised by a backtest execution.
#[derive(thiserror::Error, Debug, Clone, Serialize, Deserialize, PartialEq)]
#[error("{category}: {message}")]
pub struct ExecutionError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ExecutionError {
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self {
            category,
            message: msg.into(),
        }
    }

    pub fn data_unavailable(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::DataUnavailable, msg)
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ExecutionError, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Timeout, msg)
    }

    pub fn infra(msg: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InfraError, msg)
    }

    pub fn retryable(&self) -> bool {
        self.category.retryable()
    }
}

/// Input handed to the execution function. Everything it needs is in here,
/// so a retry replays exactly the same call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub job_id: i32,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: BTreeMap<String, Value>,
    pub start_date: String,
    pub end_date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionOutput {
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub artifact_ref: Option<String>,
    #[serde(default)]
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Metrics {
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub trade_count: f64,
    pub avg_trade_return: f64,
}

impl Metrics {
    /// Returns the names of missing metrics when the map is not well-formed.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Result<Self, Vec<&'static str>> {
        let missing: Vec<&'static str> = REQUIRED_METRICS
            .iter()
            .copied()
            .filter(|name| !map.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        let get = |name: &str| map.get(name).copied().unwrap_or_default();
        Ok(Self {
            sharpe_ratio: get("sharpe_ratio"),
            sortino_ratio: get("sortino_ratio"),
            max_drawdown: get("max_drawdown"),
            win_rate: get("win_rate"),
            profit_factor: get("profit_factor"),
            trade_count: get("trade_count"),
            avg_trade_return: get("avg_trade_return"),
        })
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "sharpe_ratio" => Some(self.sharpe_ratio),
            "sortino_ratio" => Some(self.sortino_ratio),
            "max_drawdown" => Some(self.max_drawdown),
            "win_rate" => Some(self.win_rate),
            "profit_factor" => Some(self.profit_factor),
            "trade_count" => Some(self.trade_count),
            "avg_trade_return" => Some(self.avg_trade_return),
            _ => None,
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        REQUIRED_METRICS
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.to_string(), v)))
            .collect()
    }
}
