mod common;

use async_trait::async_trait;
use backtest_orchestrator::backtest::{
    BacktestExecutor, ErrorCategory, ExecutionError, ExecutionOutput, ExecutionRequest, JobOutcome,
    TaskIsolated, Worker, WorkerConfig, WorkerPool,
};
use backtest_orchestrator::consolidate::{Consolidator, ExportFormat};
use backtest_orchestrator::queue::JobStatus;
use backtest_orchestrator::storage::now_ms;
use backtest_orchestrator::tracker::{ExperimentTracker, LogTracker, TrackedRun, TrackerError};
use common::{
    batch_request, metrics_for, new_job, params, record, setup, setup_orchestrator, StubExecutor,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        lease_duration: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(1),
        idle_backoff: Duration::from_millis(20),
        lease_wait: Duration::from_millis(200),
        job_timeout: None,
    }
}

#[derive(Default)]
struct CountingTracker {
    runs: AtomicUsize,
}

#[async_trait]
impl ExperimentTracker for CountingTracker {
    async fn log_run(&self, run: &TrackedRun) -> Result<(), TrackerError> {
        assert_eq!(run.metrics.len(), 7);
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingTracker;

#[async_trait]
impl ExperimentTracker for FailingTracker {
    async fn log_run(&self, _run: &TrackedRun) -> Result<(), TrackerError> {
        Err(TrackerError::Http("503 tracking server down".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_end_to_end_batch_with_unavailable_pair() {
    let (_dir, orch) = setup_orchestrator().await;
    let batch_id = orch
        .submit_batch(
            batch_request(&["SPY", "QQQ", "IWM"], &["sma", "rsi"], params(&[20])),
            |_| 5,
        )
        .await
        .unwrap();

    let executor = Arc::new(StubExecutor::with_unavailable("QQQ", "rsi"));
    let mut pool = WorkerPool::new(orch.queue().clone(), executor.clone(), fast_config())
        .with_reap_interval(Duration::from_millis(200));
    pool.recover().await.unwrap();
    pool.start_workers(2);
    pool.start_reaper();

    let tracker = Arc::new(CountingTracker::default());
    let consolidator = Consolidator::new(orch, tracker.clone());
    let (outcome, table) = consolidator
        .consolidate_when_complete(&batch_id, Duration::from_secs(30))
        .await
        .unwrap();
    pool.shutdown().await;

    assert!(!outcome.timed_out);
    assert_eq!(outcome.status.succeeded, 5);
    assert_eq!(outcome.status.failed, 1);
    assert_eq!(executor.calls(), 6, "data_unavailable is never retried");

    assert_eq!(table.rows.len(), 6);
    let failed: Vec<_> = table
        .rows
        .iter()
        .filter(|r| r.error_category.as_deref() == Some("data_unavailable"))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!((failed[0].symbol.as_str(), failed[0].strategy_id.as_str()), ("QQQ", "rsi"));
    assert!(failed[0].metrics.is_none());
    assert!(failed[0].error_message.as_deref().unwrap().contains("no bars"));
    assert!(table
        .rows
        .iter()
        .filter(|r| r.status == JobStatus::Succeeded)
        .all(|r| r.metrics.is_some() && r.duration_ms == Some(5)));
    assert!(table.quarantined.is_empty());

    // forwarded once, even across repeated consolidation
    assert_eq!(tracker.runs.load(Ordering::SeqCst), 5);
    let csv = consolidator.export(&batch_id, ExportFormat::Csv).await.unwrap();
    assert_eq!(csv.lines().count(), 7);
    assert_eq!(tracker.runs.load(Ordering::SeqCst), 5);

    let summary = consolidator.summary(&batch_id).await.unwrap();
    assert!((summary.failure_rate - 1.0 / 6.0).abs() < 1e-9);
    assert_eq!(summary.error_counts["data_unavailable"], 1);
    assert_eq!(summary.median_duration_ms, Some(5));

    let log = consolidator.orchestrator().error_log(&batch_id).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].category, "data_unavailable");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tracker_failure_does_not_fail_consolidation() {
    let (_dir, orch) = setup_orchestrator().await;
    let batch_id = orch
        .submit_batch(batch_request(&["SPY"], &["sma"], params(&[5, 10])), |_| 5)
        .await
        .unwrap();
    let worker = Worker::new(
        "w1",
        orch.queue().clone(),
        Arc::new(StubExecutor::default()),
        fast_config(),
    );
    while worker.run_once().await.unwrap().is_some() {}

    let consolidator = Consolidator::new(orch, Arc::new(FailingTracker));
    let table = consolidator.consolidate(&batch_id).await.unwrap();
    assert_eq!(table.rows.len(), 2);
    assert!(table.rows.iter().all(|r| r.metrics.is_some()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_job_timeout_is_retried_then_failed() {
    let (_dir, queue) = setup().await;
    queue.enqueue(vec![new_job("b", "SPY", 1)]).await.unwrap();

    let executor = StubExecutor {
        delay: Duration::from_millis(500),
        ..Default::default()
    };
    let config = WorkerConfig {
        job_timeout: Some(Duration::from_millis(30)),
        ..fast_config()
    };
    let worker = Worker::new("w1", queue.clone(), Arc::new(executor), config);

    let mut statuses = Vec::new();
    while let Some(outcome) = worker.run_once().await.unwrap() {
        match outcome {
            JobOutcome::Failed {
                category, status, ..
            } => {
                assert_eq!(category, ErrorCategory::Timeout);
                statuses.push(status);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(
        statuses,
        vec![JobStatus::Pending, JobStatus::Pending, JobStatus::Failed]
    );
    let log = queue.error_log("b").await.unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|e| e.category == "timeout"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_worker_abandons_job_when_lease_is_lost() {
    let (_dir, queue) = setup().await;
    queue.enqueue(vec![new_job("b", "SPY", 1)]).await.unwrap();

    let executor = StubExecutor {
        delay: Duration::from_secs(5),
        ..Default::default()
    };
    let config = WorkerConfig {
        lease_duration: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        ..fast_config()
    };
    let worker = Worker::new("slow", queue.clone(), Arc::new(executor), config);
    let job = worker.lease_next().await.unwrap().unwrap();

    let reaper = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        // simulate the reaper deciding the lease is long gone
        reaper
            .reclaim_expired_at(now_ms() + 60_000)
            .await
            .unwrap();
    });

    let started = Instant::now();
    let outcome = worker.process(job.clone()).await.unwrap();
    assert_eq!(outcome, JobOutcome::LeaseLost { job_id: job.job_id });
    assert!(started.elapsed() < Duration::from_secs(2));

    let job = queue.job(job.job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rerun_after_crash_converges_to_same_result() {
    let (_dir, orch) = setup_orchestrator().await;
    let batch_id = orch
        .submit_batch(batch_request(&["SPY"], &["sma"], params(&[20])), |_| 5)
        .await
        .unwrap();
    let queue = orch.queue().clone();

    // first worker takes the job and dies without reporting
    let lost = queue
        .lease("crashed", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.reclaim_expired().await.unwrap().requeued, 1);

    let executor = Arc::new(StubExecutor::default());
    let worker = Worker::new("w2", queue.clone(), executor.clone(), fast_config());
    let outcome = worker.run_once().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        JobOutcome::Completed {
            job_id: lost.job_id,
            status: JobStatus::Succeeded
        }
    );

    let consolidator = Consolidator::new(orch, Arc::new(LogTracker));
    let table = consolidator.consolidate(&batch_id).await.unwrap();
    assert_eq!(table.rows.len(), 1);
    let row = &table.rows[0];
    assert_eq!(row.attempt_count, 2);
    let expected = metrics_for(&lost.execution_request());
    assert_eq!(row.metrics.unwrap().to_map(), expected);
}

struct Incomplete;

#[async_trait]
impl BacktestExecutor for Incomplete {
    async fn execute(&self, _req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        let mut metrics = BTreeMap::new();
        metrics.insert("sharpe_ratio".to_string(), 1.1);
        Ok(ExecutionOutput {
            metrics,
            artifact_ref: None,
            duration_ms: 3,
        })
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_results_are_quarantined() {
    let (_dir, orch) = setup_orchestrator().await;
    let batch_id = orch
        .submit_batch(batch_request(&["SPY", "QQQ"], &["sma"], params(&[20])), |_| 5)
        .await
        .unwrap();
    let queue = orch.queue().clone();

    // worker side: incomplete metrics never reach SUCCEEDED
    let worker = Worker::new("w1", queue.clone(), Arc::new(Incomplete), fast_config());
    match worker.run_once().await.unwrap().unwrap() {
        JobOutcome::Failed {
            category, status, ..
        } => {
            assert_eq!(category, ErrorCategory::MalformedResult);
            assert_eq!(status, JobStatus::Failed);
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    // store side: a SUCCEEDED job whose stored result is incomplete
    let job = queue
        .lease("raw", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let mut partial = BTreeMap::new();
    partial.insert("sharpe_ratio".to_string(), 0.9);
    queue.complete(&job.lease().unwrap(), record(partial)).await.unwrap();

    let consolidator = Consolidator::new(orch, Arc::new(LogTracker));
    let table = consolidator.consolidate(&batch_id).await.unwrap();
    assert_eq!(table.rows.len(), 2);
    assert_eq!(table.quarantined.len(), 1);
    assert_eq!(table.quarantined[0].job_id, job.job_id);
    assert!(table
        .rows
        .iter()
        .all(|r| r.error_category.as_deref() == Some("malformed_result") && r.metrics.is_none()));

    consolidator.consolidate(&batch_id).await.unwrap();
    let log = consolidator.orchestrator().error_log(&batch_id).await.unwrap();
    assert_eq!(
        log.iter().filter(|e| e.category == "malformed_result").count(),
        2,
        "one from the worker, one from consolidation, no duplicates"
    );
}

struct Panicky;

#[async_trait]
impl BacktestExecutor for Panicky {
    async fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutput, ExecutionError> {
        panic!("strategy {} blew up", req.strategy_id);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_executor_is_contained() {
    let (_dir, queue) = setup().await;
    queue.enqueue(vec![new_job("b", "SPY", 1)]).await.unwrap();
    let worker = Worker::new(
        "w1",
        queue.clone(),
        Arc::new(TaskIsolated::new(Panicky)),
        fast_config(),
    );

    let mut categories = Vec::new();
    while let Some(JobOutcome::Failed { category, .. }) = worker.run_once().await.unwrap() {
        categories.push(category);
    }
    // execution errors get exactly one retry
    assert_eq!(categories, vec![ErrorCategory::ExecutionError; 2]);
    let jobs = queue.jobs_for_batch("b").await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Failed);
    assert!(jobs[0].error_message.as_deref().unwrap().contains("blew up"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_never_strands_a_leased_job() {
    let (_dir, queue) = setup().await;
    let jobs = (0..40).map(|i| new_job("b", &format!("S{}", i), 5)).collect();
    queue.enqueue(jobs).await.unwrap();

    let executor = Arc::new(StubExecutor {
        delay: Duration::from_millis(10),
        ..Default::default()
    });
    let mut pool = WorkerPool::new(queue.clone(), executor.clone(), fast_config());
    pool.start_workers(4);
    tokio::time::sleep(Duration::from_millis(35)).await;
    pool.shutdown().await;

    let jobs = queue.jobs_for_batch("b").await.unwrap();
    assert!(jobs.iter().all(|j| j.status != JobStatus::Running));
    let succeeded = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Succeeded)
        .count();
    assert_eq!(succeeded, executor.calls(), "every leased job was reported");
    assert!(queue.error_log("b").await.unwrap().is_empty());
}
