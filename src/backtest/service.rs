use crate::backtest::executor::BacktestExecutor;
use crate::backtest::worker::{Worker, WorkerConfig};
use crate::error::Result;
use crate::queue::{JobQueue, ReclaimReport};
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};

/// Resident workers plus the lease reaper, sharing one queue and one shutdown signal.
pub struct WorkerPool {
    queue: JobQueue,
    executor: Arc<dyn BacktestExecutor>,
    config: WorkerConfig,
    reap_interval: Duration,
    id_prefix: String,
    started: usize,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, executor: Arc<dyn BacktestExecutor>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            queue,
            executor,
            config,
            reap_interval: Duration::from_secs(5),
            id_prefix: pool_prefix(),
            started: 0,
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }

    /// Startup recovery: jobs stranded RUNNING by a previous process.
    pub async fn recover(&self) -> Result<ReclaimReport> {
        self.queue.recover().await
    }

    /// Prefix shared by this pool's worker ids.
    pub fn id_prefix(&self) -> &str {
        &self.id_prefix
    }

    /// Spawns `count` workers named `<prefix>-w1..wN`.
    pub fn start_workers(&mut self, count: usize) {
        for _ in 0..count {
            self.started += 1;
            let worker = Worker::new(
                format!("{}-w{}", self.id_prefix, self.started),
                self.queue.clone(),
                self.executor.clone(),
                self.config.clone(),
            );
            let shutdown = self.shutdown_tx.subscribe();
            self.handles.push(tokio::spawn(worker.run(shutdown)));
        }
        info!("✓ started {} workers as {}-w*", count, self.id_prefix);
    }

    /// Periodic `reclaim_expired` sweep so crashed workers' jobs come back
    /// without a restart.
    pub fn start_reaper(&mut self) {
        let queue = self.queue.clone();
        let period = self.reap_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        self.handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = queue.reclaim_expired().await {
                            error!("✗ reaper sweep failed: {}", e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Signals every task and waits for in-flight jobs to report.
    pub async fn shutdown(self) {
        info!("stopping worker pool...");
        let _ = self.shutdown_tx.send(true);
        for res in futures::future::join_all(self.handles).await {
            if let Err(e) = res {
                error!("✗ worker task ended abnormally: {}", e);
            }
        }
        info!("✓ worker pool stopped");
    }
}

/// `<host>-<pid>-<random>`: distinct across processes and across pools in one process.
fn pool_prefix() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "local".to_string());
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host.trim(), std::process::id(), &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_prefixes_differ() {
        let a = pool_prefix();
        let b = pool_prefix();
        assert_ne!(a, b);
        assert!(a.contains(&format!("-{}-", std::process::id())));
    }
}
