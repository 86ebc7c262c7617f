use backtest_orchestrator::commands::{self, Cli};
use backtest_orchestrator::config::Settings;
use chrono::Local;
use clap::Parser;

fn init_logging() -> std::io::Result<()> {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .filter_level(log::LevelFilter::Warn)
        .filter_module("backtest_orchestrator", log::LevelFilter::Info)
        .filter_module("sqlx", log::LevelFilter::Error)
        .filter_module("sea_orm", log::LevelFilter::Error);

    // stdout carries command output, so logs go to stderr or a file
    if let Ok(dir) = std::env::var("ORCH_LOG_DIR") {
        let log_dir = std::path::PathBuf::from(dir);
        std::fs::create_dir_all(&log_dir)?;
        let ts = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let log_file = std::fs::File::create(log_dir.join(format!("orchestrator-{}.log", ts)))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_logging()?;

    let cli = Cli::parse();
    let settings = Settings::from_env();
    commands::dispatch(cli.command, settings).await
}
