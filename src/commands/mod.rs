pub mod app_command;
pub mod batch;
pub mod worker;

pub use app_command::{AppCommand, Cli};

use crate::config::Settings;
use crate::consolidate::Consolidator;
use crate::orchestrator::Orchestrator;
use crate::queue::JobQueue;
use crate::storage;
use std::sync::Arc;

pub async fn dispatch(command: AppCommand, settings: Settings) -> anyhow::Result<()> {
    let db = Arc::new(storage::establish_connection(&settings.database_url).await?);
    let queue = JobQueue::new(db).with_retry_policy(settings.retry_policy());
    let orchestrator = Orchestrator::new(queue.clone());

    match command {
        AppCommand::Submit {
            symbols,
            strategies,
            params,
            priority,
            start,
            end,
            max_attempts,
        } => {
            batch::submit(
                &orchestrator,
                &settings,
                symbols,
                strategies,
                params,
                &priority,
                &start,
                &end,
                max_attempts,
            )
            .await
        }
        AppCommand::Status { batch_id } => batch::status(&orchestrator, &batch_id).await,
        AppCommand::Wait {
            batch_id,
            timeout_secs,
        } => batch::wait(&orchestrator, &batch_id, timeout_secs).await,
        AppCommand::Cancel { batch_id } => batch::cancel(&orchestrator, &batch_id).await,
        AppCommand::Archive { batch_id } => batch::archive(&orchestrator, &batch_id).await,
        AppCommand::Export {
            batch_id,
            format,
            out,
        } => {
            let consolidator = Consolidator::new(orchestrator, settings.tracker());
            batch::export(&consolidator, &batch_id, &format, out.as_deref()).await
        }
        AppCommand::Summary { batch_id } => {
            let consolidator = Consolidator::new(orchestrator, settings.tracker());
            batch::summary(&consolidator, &batch_id).await
        }
        AppCommand::Worker { workers, executor } => {
            worker::run(queue, &settings, workers, executor).await
        }
        AppCommand::Reclaim => worker::reclaim(&queue).await,
    }
}
