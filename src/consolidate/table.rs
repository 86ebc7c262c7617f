use crate::backtest::model::{Metrics, REQUIRED_METRICS};
use crate::error::Result;
use crate::queue::{ErrorLogEntry, JobStatus};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

/// One row per job of the batch, whatever its outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub job_id: i32,
    pub symbol: String,
    pub strategy_id: String,
    pub parameters: BTreeMap<String, Value>,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub duration_ms: Option<i64>,
    pub error_category: Option<String>,
    pub error_message: Option<String>,
    pub metrics: Option<Metrics>,
    pub artifact_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidatedTable {
    pub batch_id: String,
    pub rows: Vec<ResultRow>,
    /// Ledger entries for results that could not be used.
    pub quarantined: Vec<ErrorLogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

impl ConsolidatedTable {
    pub fn export(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&self.rows)?),
            ExportFormat::Csv => self.to_csv(),
        }
    }

    pub fn write_to(&self, path: &Path, format: ExportFormat) -> Result<()> {
        std::fs::write(path, self.export(format)?)?;
        Ok(())
    }

    fn to_csv(&self) -> Result<String> {
        let mut out = String::from(
            "job_id,symbol,strategy_id,parameters,status,attempt_count,duration_ms,error_category,error_message",
        );
        for name in REQUIRED_METRICS {
            out.push(',');
            out.push_str(name);
        }
        out.push_str(",artifact_ref\n");

        for r in &self.rows {
            let params = serde_json::to_string(&r.parameters)?;
            let _ = write!(
                out,
                "{},{},{},{},{},{},{},{},{}",
                r.job_id,
                csv_escape(&r.symbol),
                csv_escape(&r.strategy_id),
                csv_escape(&params),
                r.status,
                r.attempt_count,
                r.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                csv_escape(r.error_category.as_deref().unwrap_or("")),
                csv_escape(r.error_message.as_deref().unwrap_or("")),
            );
            for name in REQUIRED_METRICS {
                out.push(',');
                if let Some(v) = r.metrics.as_ref().and_then(|m| m.get(name)) {
                    let _ = write!(out, "{}", v);
                }
            }
            out.push(',');
            out.push_str(&csv_escape(r.artifact_ref.as_deref().unwrap_or("")));
            out.push('\n');
        }
        Ok(out)
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
