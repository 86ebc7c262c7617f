use crate::config::Settings;
use crate::consolidate::{Consolidator, ExportFormat};
use crate::orchestrator::{BatchRequest, Orchestrator, PriorityRules};
use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn parse_date(raw: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?}, expected YYYY-MM-DD", raw))
}

fn load_parameter_sets(path: Option<&Path>) -> anyhow::Result<Vec<BTreeMap<String, Value>>> {
    let Some(path) = path else {
        return Ok(vec![BTreeMap::new()]);
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read params file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} must hold a JSON array of objects", path.display()))
}

#[allow(clippy::too_many_arguments)]
pub async fn submit(
    orchestrator: &Orchestrator,
    settings: &Settings,
    symbols: Vec<String>,
    strategies: Vec<String>,
    params: Option<PathBuf>,
    priority: &str,
    start: &str,
    end: &str,
    max_attempts: Option<i32>,
) -> anyhow::Result<()> {
    let rules: PriorityRules = priority.parse().map_err(|e| anyhow!("--priority: {}", e))?;
    let request = BatchRequest {
        symbols,
        strategies,
        parameter_sets: load_parameter_sets(params.as_deref())?,
        start_date: parse_date(start)?,
        end_date: parse_date(end)?,
        max_attempts: max_attempts.unwrap_or(settings.max_attempts),
    };
    let batch_id = orchestrator
        .submit_batch(request, |spec| rules.priority_for(spec))
        .await?;
    println!("{}", batch_id);
    Ok(())
}

pub async fn status(orchestrator: &Orchestrator, batch_id: &str) -> anyhow::Result<()> {
    let status = orchestrator.get_batch_status(batch_id).await?;
    let errors = orchestrator.error_log(batch_id).await?;
    let out = json!({ "status": status, "errors": errors });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

pub async fn wait(
    orchestrator: &Orchestrator,
    batch_id: &str,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let outcome = orchestrator
        .wait_for_batch(batch_id, Duration::from_secs(timeout_secs))
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.timed_out {
        return Err(anyhow!(
            "batch {} still has {} pending / {} running jobs",
            batch_id,
            outcome.status.pending,
            outcome.status.running
        ));
    }
    Ok(())
}

pub async fn cancel(orchestrator: &Orchestrator, batch_id: &str) -> anyhow::Result<()> {
    let report = orchestrator.cancel_batch(batch_id).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub async fn archive(orchestrator: &Orchestrator, batch_id: &str) -> anyhow::Result<()> {
    orchestrator.archive_batch(batch_id).await?;
    println!("✓ archived {}", batch_id);
    Ok(())
}

pub async fn export(
    consolidator: &Consolidator,
    batch_id: &str,
    format: &str,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let format: ExportFormat = format.parse().map_err(|e: String| anyhow!(e))?;
    let table = consolidator.consolidate(batch_id).await?;
    match out {
        Some(path) => {
            table.write_to(path, format)?;
            eprintln!("✓ wrote {} rows to {}", table.rows.len(), path.display());
        }
        None => print!("{}", table.export(format)?),
    }
    Ok(())
}

pub async fn summary(consolidator: &Consolidator, batch_id: &str) -> anyhow::Result<()> {
    let summary = consolidator.summary(batch_id).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parameter_sets_default_to_one_empty_set() {
        let sets = load_parameter_sets(None).unwrap();
        assert_eq!(sets, vec![BTreeMap::new()]);
    }

    #[test]
    fn test_parameter_sets_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, r#"[{{"fast": 10, "slow": 30}}, {{"fast": 20, "slow": 50}}]"#).unwrap();
        let sets = load_parameter_sets(Some(f.path())).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1]["slow"], json!(50));
    }

    #[test]
    fn test_parse_date() {
        assert!(parse_date("2021-03-04").is_ok());
        assert!(parse_date("03/04/2021").is_err());
    }
}
