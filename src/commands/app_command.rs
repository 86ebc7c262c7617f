use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "backtest-orchestrator")]
#[command(about = "Queue-backed orchestrator for symbol × strategy × parameter backtest batches")]
pub struct Cli {
    #[command(subcommand)]
    pub command: AppCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum AppCommand {
    /// Expand a matrix into jobs and enqueue them; prints the batch id.
    Submit {
        /// Comma separated, e.g. `SPY,QQQ,IWM`
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long, value_delimiter = ',', required = true)]
        strategies: Vec<String>,
        /// JSON file holding an array of parameter objects; defaults to `[{}]`.
        #[arg(long)]
        params: Option<PathBuf>,
        /// Priority rules or a constant, e.g. `symbol:^SPY$=1,default=5`.
        #[arg(long, default_value = "5")]
        priority: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: String,
        /// Overrides ORCH_MAX_ATTEMPTS for this batch.
        #[arg(long)]
        max_attempts: Option<i32>,
    },
    /// JSON status snapshot including the error log.
    Status {
        #[arg(long)]
        batch_id: String,
    },
    /// Block until the batch completes or the timeout elapses.
    Wait {
        #[arg(long)]
        batch_id: String,
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
    },
    Cancel {
        #[arg(long)]
        batch_id: String,
    },
    /// Write the consolidated table as CSV or JSON.
    Export {
        #[arg(long)]
        batch_id: String,
        #[arg(long, default_value = "csv")]
        format: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Summary {
        #[arg(long)]
        batch_id: String,
    },
    /// Run a worker pool against the queue until Ctrl-C.
    Worker {
        /// Defaults to ORCH_WORKERS.
        #[arg(long)]
        workers: Option<usize>,
        /// Executor command line; defaults to ORCH_EXECUTOR_CMD.
        #[arg(long)]
        executor: Option<String>,
    },
    /// One reclaim sweep over expired leases.
    Reclaim,
    Archive {
        #[arg(long)]
        batch_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "backtest-orchestrator",
            "submit",
            "--symbols",
            "SPY,QQQ",
            "--strategies",
            "sma_cross",
            "--start",
            "2020-01-01",
            "--end",
            "2020-12-31",
        ])
        .unwrap();
        match cli.command {
            AppCommand::Submit {
                symbols,
                strategies,
                priority,
                params,
                ..
            } => {
                assert_eq!(symbols, vec!["SPY", "QQQ"]);
                assert_eq!(strategies, vec!["sma_cross"]);
                assert_eq!(priority, "5");
                assert!(params.is_none());
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_export_requires_batch_id() {
        assert!(Cli::try_parse_from(["backtest-orchestrator", "export"]).is_err());
    }
}
