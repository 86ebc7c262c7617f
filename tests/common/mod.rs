#![allow(dead_code)]

use async_trait::async_trait;
use backtest_orchestrator::backtest::{
    BacktestExecutor, ExecutionError, ExecutionOutput, ExecutionRequest,
};
use backtest_orchestrator::orchestrator::{BatchRequest, Orchestrator};
use backtest_orchestrator::queue::{JobQueue, JobResultRecord, NewJob, RetryPolicy};
use backtest_orchestrator::storage::establish_connection;
use chrono::NaiveDate;
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn db_url(dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", dir.join("queue.db").display())
}

pub async fn connect(dir: &Path) -> Arc<DatabaseConnection> {
    Arc::new(establish_connection(&db_url(dir)).await.unwrap())
}

/// Fresh on-disk database per test; keep the `TempDir` alive for the test's duration.
pub async fn setup() -> (TempDir, JobQueue) {
    let dir = tempfile::tempdir().unwrap();
    let db = connect(dir.path()).await;
    let queue = JobQueue::new(db).with_retry_policy(RetryPolicy::immediate());
    (dir, queue)
}

pub async fn setup_orchestrator() -> (TempDir, Orchestrator) {
    let (dir, queue) = setup().await;
    let orchestrator = Orchestrator::new(queue).with_poll_interval(Duration::from_millis(20));
    (dir, orchestrator)
}

pub fn new_job(batch_id: &str, symbol: &str, priority: i32) -> NewJob {
    NewJob {
        batch_id: batch_id.to_string(),
        symbol: symbol.to_string(),
        strategy_id: "sma_cross".to_string(),
        parameters: BTreeMap::new(),
        start_date: "2020-01-01".to_string(),
        end_date: "2020-12-31".to_string(),
        priority,
        max_attempts: 3,
    }
}

pub fn batch_request(symbols: &[&str], strategies: &[&str], params: Vec<Value>) -> BatchRequest {
    BatchRequest {
        symbols: symbols.iter().map(|s| s.to_string()).collect(),
        strategies: strategies.iter().map(|s| s.to_string()).collect(),
        parameter_sets: params
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect(),
        start_date: NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        end_date: NaiveDate::from_ymd_opt(2020, 12, 31).unwrap(),
        max_attempts: 3,
    }
}

/// Deterministic metrics derived from the request, so re-runs converge.
pub fn metrics_for(req: &ExecutionRequest) -> BTreeMap<String, f64> {
    let seed = req
        .symbol
        .bytes()
        .chain(req.strategy_id.bytes())
        .chain(serde_json::to_string(&req.parameters).unwrap().into_bytes())
        .fold(7u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    let x = (seed % 1000) as f64 / 1000.0;
    let mut m = BTreeMap::new();
    m.insert("sharpe_ratio".to_string(), 0.5 + x);
    m.insert("sortino_ratio".to_string(), 0.8 + x);
    m.insert("max_drawdown".to_string(), 0.05 + x / 10.0);
    m.insert("win_rate".to_string(), 0.4 + x / 5.0);
    m.insert("profit_factor".to_string(), 1.0 + x);
    m.insert("trade_count".to_string(), (seed % 200) as f64);
    m.insert("avg_trade_return".to_string(), x / 100.0);
    m
}

pub fn record(metrics: BTreeMap<String, f64>) -> JobResultRecord {
    JobResultRecord {
        metrics,
        artifact_ref: None,
        duration_ms: 10,
    }
}

pub fn full_record() -> JobResultRecord {
    record(metrics_for(&ExecutionRequest {
        job_id: 0,
        symbol: "SPY".into(),
        strategy_id: "sma_cross".into(),
        parameters: BTreeMap::new(),
        start_date: "2020-01-01".into(),
        end_date: "2020-12-31".into(),
    }))
}

/// Pure stub: metrics depend only on the request; listed (symbol, strategy)
/// pairs raise `data_unavailable`.
#[derive(Default)]
pub struct StubExecutor {
    pub unavailable: HashSet<(String, String)>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl StubExecutor {
    pub fn with_unavailable(symbol: &str, strategy: &str) -> Self {
        let mut unavailable = HashSet::new();
        unavailable.insert((symbol.to_string(), strategy.to_string()));
        Self {
            unavailable,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BacktestExecutor for StubExecutor {
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self
            .unavailable
            .contains(&(req.symbol.clone(), req.strategy_id.clone()))
        {
            return Err(ExecutionError::data_unavailable(format!(
                "no bars for {} in {}..{}",
                req.symbol, req.start_date, req.end_date
            )));
        }
        Ok(ExecutionOutput {
            metrics: metrics_for(req),
            artifact_ref: Some(format!("mem://{}", req.job_id)),
            duration_ms: 5,
        })
    }
}

pub fn params(values: &[i64]) -> Vec<Value> {
    values.iter().map(|v| json!({ "window": v })).collect()
}
