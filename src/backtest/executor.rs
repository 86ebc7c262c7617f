use crate::backtest::model::{ErrorCategory, ExecutionError, ExecutionOutput, ExecutionRequest};
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// The external backtest computation. Must be a pure function of the request,
/// so re-running a retried job converges to the same metrics.
#[async_trait]
pub trait BacktestExecutor: Send + Sync {
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError>;
}

#[async_trait]
impl<E: BacktestExecutor + ?Sized> BacktestExecutor for Arc<E> {
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        (**self).execute(req).await
    }
}

/// Runs the inner executor on its own tokio task so a panic stays inside the
/// job and comes back as an `execution_error`.
pub struct TaskIsolated<E> {
    inner: Arc<E>,
}

impl<E> TaskIsolated<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl<E: BacktestExecutor + 'static> BacktestExecutor for TaskIsolated<E> {
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let inner = self.inner.clone();
        let req = req.clone();
        let handle = tokio::spawn(async move { inner.execute(&req).await });
        let abort = handle.abort_handle();
        // dropping this future (timeout / lost lease) must stop the task too
        let _guard = AbortOnDrop(abort);
        match handle.await {
            Ok(res) => res,
            Err(e) if e.is_panic() => Err(ExecutionError::execution(format!(
                "executor panicked: {}",
                panic_message(e.into_panic())
            ))),
            Err(e) => Err(ExecutionError::infra(format!("executor task aborted: {}", e))),
        }
    }
}

struct AbortOnDrop(tokio::task::AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    category: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SubprocessReply {
    Failure { error: ReplyError },
    Success(ExecutionOutput),
}

/// One OS process per job: request JSON on stdin, reply JSON on stdout.
///
/// Success: `{"metrics": {...}, "artifact_ref": "...", "duration_ms": 1234}`
/// Failure: `{"error": {"category": "data_unavailable", "message": "..."}}`
#[derive(Debug, Clone)]
pub struct SubprocessExecutor {
    program: String,
    args: Vec<String>,
}

impl SubprocessExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a command line on whitespace: `"python3 run_backtest.py --fast"`.
    pub fn from_command_line(cmd: &str) -> Option<Self> {
        let mut parts = cmd.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }
}

#[async_trait]
impl BacktestExecutor for SubprocessExecutor {
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let payload = serde_json::to_vec(req)
            .map_err(|e| ExecutionError::infra(format!("encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::infra(format!("spawn {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ExecutionError::infra(format!("write request: {}", e)))?;
            // closing stdin signals end of request
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutionError::infra(format!("wait for executor: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(
            "executor for job {} exited with {:?}",
            req.job_id,
            output.status.code()
        );

        match serde_json::from_str::<SubprocessReply>(stdout.trim()) {
            Ok(SubprocessReply::Failure { error }) => Err(ExecutionError::new(
                reported_category(&error.category),
                error.message,
            )),
            Ok(SubprocessReply::Success(out)) if output.status.success() => Ok(out),
            _ => match output.status.code() {
                None => Err(ExecutionError::infra(format!(
                    "executor killed by signal: {}",
                    tail(&stderr)
                ))),
                Some(0) => Err(ExecutionError::execution(format!(
                    "unparseable executor output: {}",
                    tail(&stdout)
                ))),
                Some(code) => Err(ExecutionError::execution(format!(
                    "executor exited with {}: {}",
                    code,
                    tail(&stderr)
                ))),
            },
        }
    }
}

/// Executors may only claim the execution categories; `malformed_result` and
/// `cancelled` are decided by the queue, and anything unknown is an execution error.
fn reported_category(raw: &str) -> ErrorCategory {
    match raw.parse::<ErrorCategory>() {
        Ok(
            category @ (ErrorCategory::DataUnavailable
            | ErrorCategory::ExecutionError
            | ErrorCategory::Timeout
            | ErrorCategory::InfraError),
        ) => category,
        _ => ErrorCategory::ExecutionError,
    }
}

fn tail(s: &str) -> String {
    const MAX: usize = 512;
    let s = s.trim();
    if s.len() <= MAX {
        return s.to_string();
    }
    let mut start = s.len() - MAX;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &s[start..])
}
