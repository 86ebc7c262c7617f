use crate::backtest::executor::BacktestExecutor;
use crate::backtest::model::{ErrorCategory, ExecutionError, ExecutionOutput, Metrics};
use crate::error::{OrchestratorError, Result};
use crate::queue::{Job, JobQueue, JobResultRecord, JobStatus, Lease};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub lease_duration: Duration,
    pub heartbeat_interval: Duration,
    /// Sleep between empty polls.
    pub idle_backoff: Duration,
    /// Upper bound on one `lease_next` call when the queue is empty.
    pub lease_wait: Duration,
    /// Wall-clock budget per job; `None` trusts the lease alone.
    pub job_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            idle_backoff: Duration::from_millis(300),
            lease_wait: Duration::from_secs(5),
            job_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// SUCCEEDED, or CANCELLED when the batch was cancelled mid-flight.
    Completed { job_id: i32, status: JobStatus },
    /// `status` is where the job went: PENDING (retry), FAILED or CANCELLED.
    Failed {
        job_id: i32,
        category: ErrorCategory,
        status: JobStatus,
    },
    /// Ownership moved elsewhere (lease reclaimed); the attempt was abandoned.
    LeaseLost { job_id: i32 },
}

pub struct Worker {
    id: String,
    queue: JobQueue,
    executor: Arc<dyn BacktestExecutor>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: JobQueue,
        executor: Arc<dyn BacktestExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id: id.into(),
            queue,
            executor,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Lease with a bounded wait: polls every `idle_backoff` until `lease_wait` runs out.
    pub async fn lease_next(&self) -> Result<Option<Job>> {
        let deadline = Instant::now() + self.config.lease_wait;
        loop {
            if let Some(job) = self
                .queue
                .lease(&self.id, self.config.lease_duration)
                .await?
            {
                return Ok(Some(job));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            sleep(self.config.idle_backoff.min(deadline - now)).await;
        }
    }

    /// Leases and processes at most one job.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        match self.lease_next().await? {
            Some(job) => Ok(Some(self.process(job).await?)),
            None => Ok(None),
        }
    }

    /// Main loop; exits once `shutdown` flips to true. Shutdown is only observed
    /// between lease calls and while idle, so a lease that commits is always
    /// processed and reported.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("worker {} started", self.id);
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.queue.lease(&self.id, self.config.lease_duration).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process(job).await {
                        error!("✗ [{}] failed to report job outcome: {}", self.id, e);
                        sleep(self.config.idle_backoff).await;
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("⚠ [{}] lease failed: {}", self.id, e),
            }
            tokio::select! {
                _ = sleep(self.config.idle_backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("worker {} stopped", self.id);
    }

    /// Runs one leased job to a reported outcome. Execution errors never escape:
    /// they are classified and handed to `fail`.
    pub async fn process(&self, job: Job) -> Result<JobOutcome> {
        let job_id = job.job_id;
        let lease = job.lease().ok_or_else(|| OrchestratorError::LeaseLost {
            job_id,
            worker_id: self.id.clone(),
        })?;
        info!(
            "🚀 [{}] job {} attempt {}/{}: {} {} {:?}",
            self.id,
            job_id,
            job.attempt_count,
            job.max_attempts,
            job.symbol,
            job.strategy_id,
            job.parameters
        );

        let started = Instant::now();
        let executed = match self.execute_with_heartbeat(&job, &lease).await {
            Some(res) => res,
            None => {
                warn!("⚠ [{}] lost lease on job {}, abandoning", self.id, job_id);
                return Ok(JobOutcome::LeaseLost { job_id });
            }
        };

        let reported = match executed {
            Ok(output) => {
                let elapsed = started.elapsed().as_millis() as i64;
                self.report_success(&lease, output, elapsed).await
            }
            Err(err) => self.report_failure(&lease, err).await,
        };

        match reported {
            Err(OrchestratorError::LeaseLost { .. }) => {
                warn!(
                    "⚠ [{}] job {} finished after its lease was reclaimed; outcome dropped",
                    self.id, job_id
                );
                Ok(JobOutcome::LeaseLost { job_id })
            }
            other => other,
        }
    }

    async fn report_success(
        &self,
        lease: &Lease,
        output: ExecutionOutput,
        elapsed_ms: i64,
    ) -> Result<JobOutcome> {
        if let Err(missing) = Metrics::from_map(&output.metrics) {
            let err = ExecutionError::new(
                ErrorCategory::MalformedResult,
                format!("result missing metrics: {}", missing.join(", ")),
            );
            return self.report_failure(lease, err).await;
        }

        let duration_ms = if output.duration_ms > 0 {
            output.duration_ms
        } else {
            elapsed_ms
        };
        let status = self
            .queue
            .complete(
                lease,
                JobResultRecord {
                    metrics: output.metrics,
                    artifact_ref: output.artifact_ref,
                    duration_ms,
                },
            )
            .await?;
        Ok(JobOutcome::Completed {
            job_id: lease.job_id,
            status,
        })
    }

    async fn report_failure(&self, lease: &Lease, err: ExecutionError) -> Result<JobOutcome> {
        warn!("✗ [{}] job {} failed: {}", self.id, lease.job_id, err);
        let status = self
            .queue
            .fail(lease, err.category, &err.message)
            .await?;
        Ok(JobOutcome::Failed {
            job_id: lease.job_id,
            category: err.category,
            status,
        })
    }

    /// Execution and heartbeat race each other. `None` means the lease was lost
    /// and the execution future was dropped.
    async fn execute_with_heartbeat(
        &self,
        job: &Job,
        lease: &Lease,
    ) -> Option<std::result::Result<ExecutionOutput, ExecutionError>> {
        let request = job.execution_request();
        let budget = self.config.job_timeout;
        let executor = self.executor.clone();
        let execution = async move {
            let fut = executor.execute(&request);
            match budget {
                Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                    Err(ExecutionError::timeout(format!(
                        "exceeded wall-clock budget of {:?}",
                        limit
                    )))
                }),
                None => fut.await,
            }
        };
        tokio::pin!(execution);

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                res = &mut execution => return Some(res),
                _ = ticker.tick() => {
                    match self
                        .queue
                        .heartbeat(lease, self.config.lease_duration)
                        .await
                    {
                        Ok(()) => {}
                        Err(OrchestratorError::LeaseLost { .. }) => return None,
                        Err(e) => warn!("⚠ [{}] heartbeat for job {} failed: {}", self.id, job.job_id, e),
                    }
                }
            }
        }
    }
}
