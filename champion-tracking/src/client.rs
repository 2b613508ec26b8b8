//! MLflow REST client implementing [`TrackingService`].

use async_trait::async_trait;
use champion_core::config::TrackingConfig;
use champion_core::error::TrackingError;
use champion_core::tracking::{RemoteRun, RunQuery, TrackingService};
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::models::{
    ErrorResponse, FileInfo, ListArtifactsResponse, Run, RunViewType, SearchRunsRequest,
    SearchRunsResponse, status_name,
};

const API_PREFIX: &str = "api/2.0/mlflow/";
const DEFAULT_PAGE_SIZE: u32 = 500;

/// Client for an MLflow-compatible tracking server.
#[derive(Debug, Clone)]
pub struct MlflowTrackingClient {
    http: Client,
    base_url: Url,
    experiment_ids: Vec<String>,
    page_size: u32,
    request_timeout: Duration,
}

impl MlflowTrackingClient {
    pub fn new(base_url: &str, experiment_ids: Vec<String>) -> Result<Self, TrackingError> {
        let mut base_url = Url::parse(base_url).map_err(|e| TrackingError::Unreachable {
            message: format!("invalid base url '{base_url}': {e}"),
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let request_timeout = Duration::from_secs(30);
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| TrackingError::Unreachable {
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url,
            experiment_ids,
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout,
        })
    }

    /// `Ok(None)` when no base URL is configured.
    pub fn from_config(config: &TrackingConfig) -> Result<Option<Self>, TrackingError> {
        let Some(base_url) = &config.base_url else {
            return Ok(None);
        };
        let client = Self::new(base_url, config.experiment_ids.clone())?
            .with_page_size(config.page_size)
            .with_request_timeout(config.timeout());
        Ok(Some(client))
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Timeout for search and listing requests. Artifact downloads are bounded by the
    /// caller instead.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn api_url(&self, endpoint: &str) -> Result<Url, TrackingError> {
        self.base_url
            .join(API_PREFIX)
            .and_then(|u| u.join(endpoint))
            .map_err(|e| TrackingError::Unreachable {
                message: format!("invalid endpoint '{endpoint}': {e}"),
            })
    }

    async fn post_json<B, R>(&self, endpoint: &str, body: &B) -> Result<R, TrackingError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.api_url(endpoint)?;
        let response = self
            .http
            .post(url)
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        self.decode(response, endpoint).await
    }

    async fn get_json<R>(&self, endpoint: &str, query: &[(&str, &str)]) -> Result<R, TrackingError>
    where
        R: DeserializeOwned,
    {
        let url = self.api_url(endpoint)?;
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .query(query)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        self.decode(response, endpoint).await
    }

    async fn decode<R>(&self, response: Response, what: &str) -> Result<R, TrackingError>
    where
        R: DeserializeOwned,
    {
        let response = check_status(response, what).await?;
        let text = response.text().await.map_err(|e| self.request_error(e))?;
        serde_json::from_str(&text).map_err(|e| TrackingError::Decode {
            message: format!("{what}: {e}"),
        })
    }

    fn request_error(&self, e: reqwest::Error) -> TrackingError {
        if e.is_timeout() {
            TrackingError::Timeout {
                timeout_secs: self.request_timeout.as_secs(),
            }
        } else if e.is_decode() {
            TrackingError::Decode {
                message: e.to_string(),
            }
        } else if e.is_body() {
            TrackingError::Transfer {
                message: e.to_string(),
            }
        } else {
            TrackingError::Unreachable {
                message: e.to_string(),
            }
        }
    }

    /// Every entry directly under `path` of the run's artifact root, across pages.
    pub async fn list_artifacts(
        &self,
        run_id: &str,
        path: &str,
    ) -> Result<Vec<FileInfo>, TrackingError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("run_id", run_id), ("run_uuid", run_id), ("path", path)];
            if let Some(token) = page_token.as_deref() {
                query.push(("page_token", token));
            }
            let page: ListArtifactsResponse = self.get_json("artifacts/list", &query).await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        Ok(files)
    }

    async fn download_file(
        &self,
        run_id: &str,
        path: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, TrackingError> {
        let url = self
            .base_url
            .join("get-artifact")
            .map_err(|e| TrackingError::Unreachable {
                message: e.to_string(),
            })?;
        let request = self
            .http
            .get(url)
            .query(&[("path", path), ("run_uuid", run_id), ("run_id", run_id)])
            .send();
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(TrackingError::Cancelled),
            r = request => r.map_err(|e| self.request_error(e))?,
        };
        let response = check_status(response, &format!("artifact '{path}' of run {run_id}")).await?;

        let io_err = |e: std::io::Error| TrackingError::Transfer {
            message: format!("{}: {e}", dest.display()),
        };
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(TrackingError::Cancelled),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    file.write_all(&bytes).await.map_err(io_err)?;
                    written += bytes.len() as u64;
                }
                Some(Err(e)) => {
                    return Err(TrackingError::Transfer {
                        message: e.to_string(),
                    });
                }
                None => break,
            }
        }
        file.flush().await.map_err(io_err)?;
        Ok(written)
    }
}

/// Map a non-success response to a [`TrackingError`], reading the MLflow error envelope.
async fn check_status(response: Response, what: &str) -> Result<Response, TrackingError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let envelope: ErrorResponse = serde_json::from_str(&body).unwrap_or_default();
    if status == StatusCode::NOT_FOUND
        || envelope.error_code.as_deref() == Some("RESOURCE_DOES_NOT_EXIST")
    {
        return Err(TrackingError::NotFound {
            what: what.to_string(),
        });
    }
    let message = envelope.message.unwrap_or_else(|| {
        let mut body = body;
        body.truncate(512);
        body
    });
    Err(TrackingError::Http {
        status: status.as_u16(),
        message,
    })
}

/// MLflow search filter for a query: every tag equality plus the status, joined by AND.
pub fn build_filter(query: &RunQuery) -> String {
    let mut clauses: Vec<String> = query
        .tags
        .iter()
        .map(|(k, v)| format!("tags.\"{}\" = '{}'", k.replace('"', "\\\""), v.replace('\'', "\\'")))
        .collect();
    if let Some(status) = query.status {
        clauses.push(format!("attributes.status = '{}'", status_name(status)));
    }
    clauses.join(" AND ")
}

/// Path of `file` relative to the listed `root`, rejecting anything that would escape.
fn relative_artifact_path(root: &str, file: &str) -> Option<PathBuf> {
    let trimmed = root.trim_end_matches('/');
    let rest = file.strip_prefix(trimmed)?.trim_start_matches('/');
    let relative = PathBuf::from(rest);
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(relative)
}

#[async_trait]
impl TrackingService for MlflowTrackingClient {
    fn name(&self) -> &str {
        "mlflow"
    }

    async fn search_runs(&self, query: &RunQuery) -> Result<Vec<RemoteRun>, TrackingError> {
        let filter = build_filter(query);
        let mut runs: Vec<RemoteRun> = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0u32;
        while runs.len() < query.limit {
            let remaining = (query.limit - runs.len()).min(self.page_size as usize);
            let request = SearchRunsRequest {
                experiment_ids: self.experiment_ids.clone(),
                filter: filter.clone(),
                max_results: remaining as u32,
                page_token: page_token.take(),
                run_view_type: RunViewType::ActiveOnly,
            };
            let page: SearchRunsResponse = self.post_json("runs/search", &request).await?;
            pages += 1;
            runs.extend(
                page.runs
                    .into_iter()
                    .filter_map(Run::into_remote)
                    .filter(|r| query.matches(r)),
            );
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        runs.truncate(query.limit);
        debug!(filter = %filter, pages, runs = runs.len(), "Searched MLflow runs");
        Ok(runs)
    }

    async fn download_artifact(
        &self,
        run_id: &str,
        artifact_path: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, TrackingError> {
        if cancel.is_cancelled() {
            return Err(TrackingError::Cancelled);
        }
        let name = Path::new(artifact_path)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "artifact".into());
        let target = dest.join(name);

        let mut pending = self.list_artifacts(run_id, artifact_path).await?;
        if pending.is_empty() {
            // Listing a file yields nothing; fetch it directly.
            let bytes = self.download_file(run_id, artifact_path, &target, cancel).await?;
            debug!(run_id, artifact_path, bytes, "Downloaded artifact file");
            return Ok(target);
        }

        let mut files = 0usize;
        while let Some(entry) = pending.pop() {
            if cancel.is_cancelled() {
                return Err(TrackingError::Cancelled);
            }
            let Some(relative) = relative_artifact_path(artifact_path, &entry.path) else {
                warn!(run_id, path = %entry.path, "Skipping artifact outside requested path");
                continue;
            };
            let out = target.join(&relative);
            if entry.is_dir {
                tokio::fs::create_dir_all(&out)
                    .await
                    .map_err(|e| TrackingError::Transfer {
                        message: format!("{}: {e}", out.display()),
                    })?;
                pending.extend(self.list_artifacts(run_id, &entry.path).await?);
            } else {
                self.download_file(run_id, &entry.path, &out, cancel).await?;
                files += 1;
            }
        }
        debug!(run_id, artifact_path, files, "Downloaded artifact directory");
        Ok(target)
    }
}
