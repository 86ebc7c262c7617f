use crate::tracker::{ExperimentTracker, TrackedRun, TrackerError};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

/// MLflow REST tracker (`/api/2.0/mlflow`). Each job becomes one run:
/// create, log-batch (params, metrics, tags), then update to FINISHED.
#[derive(Clone)]
pub struct MlflowTracker {
    client: reqwest::Client,
    base_url: String,
    experiment_id: String,
}

impl MlflowTracker {
    pub fn from_env() -> Result<Self, TrackerError> {
        let base_url = std::env::var("MLFLOW_TRACKING_URI")
            .map_err(|_| TrackerError::MissingEnv("MLFLOW_TRACKING_URI"))?;
        let experiment_id =
            std::env::var("MLFLOW_EXPERIMENT_ID").unwrap_or_else(|_| "0".to_string());
        Ok(Self::new(base_url, experiment_id))
    }

    pub fn new(base_url: impl Into<String>, experiment_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            experiment_id: experiment_id.into(),
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, TrackerError> {
        let url = format!(
            "{}/api/2.0/mlflow/{}",
            self.base_url.trim_end_matches('/'),
            path
        );
        let resp = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;

        let status = resp.status();
        let raw = resp
            .text()
            .await
            .map_err(|e| TrackerError::Http(e.to_string()))?;
        if status == StatusCode::NOT_FOUND {
            return Err(TrackerError::Http(format!("{} not found: {}", path, raw)));
        }
        if !status.is_success() {
            return Err(TrackerError::Http(format!("{} {}", status.as_u16(), raw)));
        }
        if raw.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&raw)
            .map_err(|e| TrackerError::InvalidResponse(format!("json parse failed: {e}, raw={raw}")))
    }
}

/// MLflow params are strings; keep plain strings unquoted.
fn param_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl ExperimentTracker for MlflowTracker {
    async fn log_run(&self, run: &TrackedRun) -> Result<(), TrackerError> {
        let now = chrono::Utc::now().timestamp_millis();

        // 1) create
        let created = self
            .post(
                "runs/create",
                &json!({
                    "experiment_id": self.experiment_id,
                    "run_name": run.run_name(),
                    "start_time": now - run.duration_ms,
                    "tags": [
                        {"key": "batch_id", "value": run.batch_id},
                        {"key": "job_id", "value": run.job_id.to_string()},
                    ],
                }),
            )
            .await?;
        let run_id = created
            .pointer("/run/info/run_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TrackerError::InvalidResponse(format!("missing run_id: {}", created)))?
            .to_string();

        // 2) params + metrics
        let mut params = vec![
            json!({"key": "symbol", "value": run.symbol}),
            json!({"key": "strategy_id", "value": run.strategy_id}),
        ];
        params.extend(
            run.parameters
                .iter()
                .map(|(k, v)| json!({"key": k, "value": param_value(v)})),
        );
        let metrics: Vec<Value> = run
            .metrics
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| json!({"key": k, "value": v, "timestamp": now, "step": 0}))
            .collect();
        let mut tags = Vec::new();
        if let Some(artifact) = &run.artifact_ref {
            tags.push(json!({"key": "artifact_ref", "value": artifact}));
        }
        self.post(
            "runs/log-batch",
            &json!({"run_id": run_id, "params": params, "metrics": metrics, "tags": tags}),
        )
        .await?;

        // 3) finish
        self.post(
            "runs/update",
            &json!({"run_id": run_id, "status": "FINISHED", "end_time": now}),
        )
        .await?;
        Ok(())
    }
}
