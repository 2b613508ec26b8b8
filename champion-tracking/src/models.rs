//! Wire types of the MLflow REST API (`/api/2.0/mlflow`).
//!
//! Only the fields discovery and artifact download read are modelled; everything is
//! defaulted so older and newer servers both decode.

use champion_core::tracking::{RemoteRun, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Body of `POST runs/search`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRunsRequest {
    pub experiment_ids: Vec<String>,
    pub filter: String,
    pub max_results: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    pub run_view_type: RunViewType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunViewType {
    ActiveOnly,
    DeletedOnly,
    All,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchRunsResponse {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Run {
    pub info: RunInfo,
    #[serde(default)]
    pub data: RunData,
}

#[derive(Debug, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub run_id: Option<String>,
    /// Pre-1.0 servers only send this.
    #[serde(default)]
    pub run_uuid: Option<String>,
    #[serde(default)]
    pub experiment_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub artifact_uri: Option<String>,
    #[serde(default)]
    pub lifecycle_stage: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub metrics: Vec<Metric>,
    #[serde(default)]
    pub params: Vec<KeyValue>,
    #[serde(default)]
    pub tags: Vec<KeyValue>,
}

/// Latest value of a metric. JSON cannot carry NaN, so MLflow may send it as a string.
#[derive(Debug, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: MetricValue,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub step: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            MetricValue::Text(s) => s.parse().ok(),
        }
    }
}

/// Tag or param.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyValue {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListArtifactsResponse {
    #[serde(default)]
    pub root_uri: Option<String>,
    #[serde(default)]
    pub files: Vec<FileInfo>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub file_size: Option<i64>,
}

/// MLflow error envelope.
#[derive(Debug, Default, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

pub fn parse_status(status: Option<&str>) -> RunStatus {
    match status {
        Some("RUNNING") => RunStatus::Running,
        Some("SCHEDULED") => RunStatus::Scheduled,
        Some("FAILED") => RunStatus::Failed,
        Some("KILLED") => RunStatus::Killed,
        _ => RunStatus::Finished,
    }
}

pub fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "RUNNING",
        RunStatus::Scheduled => "SCHEDULED",
        RunStatus::Finished => "FINISHED",
        RunStatus::Failed => "FAILED",
        RunStatus::Killed => "KILLED",
    }
}

impl Run {
    /// `None` when the server sent neither run id field.
    pub fn into_remote(self) -> Option<RemoteRun> {
        let Run { info, data } = self;
        let run_id = info.run_id.or(info.run_uuid)?;
        let tags: BTreeMap<String, String> =
            data.tags.into_iter().map(|t| (t.key, t.value)).collect();
        let metrics = data
            .metrics
            .into_iter()
            .filter_map(|m| Some((m.key, m.value.as_f64()?)))
            .collect();
        Some(RemoteRun {
            run_id,
            status: parse_status(info.status.as_deref()),
            tags,
            metrics,
            artifact_uri: info.artifact_uri,
        })
    }
}
