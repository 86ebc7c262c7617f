use crate::backtest::{SubprocessExecutor, TaskIsolated, WorkerPool};
use crate::config::Settings;
use crate::queue::JobQueue;
use anyhow::anyhow;
use log::info;
use std::sync::Arc;

pub async fn run(
    queue: JobQueue,
    settings: &Settings,
    workers: Option<usize>,
    executor: Option<String>,
) -> anyhow::Result<()> {
    let cmd = executor
        .or_else(|| settings.executor_cmd.clone())
        .ok_or_else(|| anyhow!("no executor: pass --executor or set ORCH_EXECUTOR_CMD"))?;
    let executor = SubprocessExecutor::from_command_line(&cmd)
        .ok_or_else(|| anyhow!("empty executor command"))?;
    let count = workers.unwrap_or(settings.workers).max(1);

    let mut pool = WorkerPool::new(
        queue,
        Arc::new(TaskIsolated::new(executor)),
        settings.worker_config(),
    )
    .with_reap_interval(settings.reap_interval());

    pool.recover().await?;
    pool.start_workers(count);
    pool.start_reaper();
    info!("▶ {} workers running `{}`, Ctrl-C to stop", count, cmd);

    tokio::signal::ctrl_c().await?;
    pool.shutdown().await;
    Ok(())
}

pub async fn reclaim(queue: &JobQueue) -> anyhow::Result<()> {
    let report = queue.reclaim_expired().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
