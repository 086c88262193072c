//! Adapter for ComfyUI-compatible engines.
//!
//! Wraps the HTTP API (health, prompt submission, history, file view)
//! using [`reqwest`]. History entries appear only once a prompt reaches a
//! terminal state, so an absent entry is reported as pending.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    Artifact, EngineError, Endpoint, JobResult, JobState, OutputDescriptor, Submission,
    WorkflowEngine,
};
use crate::provider::{BoxFuture, InstanceAddress};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const OUTPUT_KEYS: [&str; 3] = ["images", "gifs", "videos"];

/// HTTP client for a ComfyUI instance.
#[derive(Clone, Debug)]
pub struct ComfyEngine {
    client: reqwest::Client,
    client_id: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    prompt_id: String,
}

#[derive(Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    status: Option<HistoryStatus>,
    #[serde(default)]
    outputs: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Deserialize)]
struct HistoryStatus {
    #[serde(default)]
    status_str: String,
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    messages: Vec<(String, Value)>,
}

#[derive(Deserialize)]
struct FileRef {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_kind")]
    kind: String,
}

fn default_kind() -> String {
    String::from("output")
}

impl ComfyEngine {
    /// Creates an engine client whose every request is bounded by
    /// `request_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connect`] when the HTTP client cannot be built.
    pub fn new(client_id: impl Into<String>, request_timeout: Duration) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|err| EngineError::Connect {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            client_id: client_id.into(),
        })
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, EngineError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unreadable body>"));
        Err(EngineError::Api {
            status: status.as_u16(),
            body,
        })
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, EngineError> {
        let checked = Self::ensure_success(response).await?;
        let body = checked.bytes().await.map_err(classify_transport)?;
        serde_json::from_slice(&body).map_err(|err| EngineError::Decode {
            message: err.to_string(),
        })
    }
}

fn classify_transport(err: reqwest::Error) -> EngineError {
    if err.is_connect() {
        EngineError::Connect {
            message: err.to_string(),
        }
    } else {
        EngineError::Transport {
            message: err.to_string(),
        }
    }
}

fn interpret_history(job_id: &str, mut history: BTreeMap<String, HistoryEntry>) -> JobState {
    let Some(entry) = history.remove(job_id) else {
        return JobState::Pending;
    };
    let Some(status) = entry.status else {
        return JobState::Running;
    };

    if status.status_str == "error" {
        return JobState::Failed(failure_detail(&status.messages));
    }
    if status.completed || status.status_str == "success" {
        return JobState::Completed(JobResult {
            outputs: collect_outputs(&entry.outputs),
        });
    }
    JobState::Running
}

fn failure_detail(messages: &[(String, Value)]) -> String {
    messages
        .iter()
        .filter(|(kind, _)| kind == "execution_error")
        .find_map(|(_, body)| {
            let message = body.get("exception_message")?.as_str()?.trim();
            let node = body.get("node_type").and_then(Value::as_str);
            Some(node.map_or_else(
                || message.to_owned(),
                |node_type| format!("{node_type}: {message}"),
            ))
        })
        .unwrap_or_else(|| String::from("engine reported an execution error"))
}

fn collect_outputs(outputs: &BTreeMap<String, BTreeMap<String, Value>>) -> Vec<OutputDescriptor> {
    outputs
        .values()
        .flat_map(|node| {
            OUTPUT_KEYS
                .iter()
                .filter_map(|key| node.get(*key))
                .filter_map(|files| serde_json::from_value::<Vec<FileRef>>(files.clone()).ok())
                .flatten()
        })
        .map(|file| OutputDescriptor {
            filename: file.filename,
            subfolder: file.subfolder,
            kind: file.kind,
        })
        .collect()
}

impl WorkflowEngine for ComfyEngine {
    fn health<'a>(&'a self, address: &'a InstanceAddress) -> BoxFuture<'a, (), EngineError> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/system_stats", address.base_url()))
                .send()
                .await
                .map_err(classify_transport)?;
            Self::ensure_success(response).await.map(|_| ())
        })
    }

    fn submit<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        submission: &'a Submission,
    ) -> BoxFuture<'a, String, EngineError> {
        Box::pin(async move {
            let body = json!({
                "prompt": submission.graph,
                "client_id": self.client_id,
                "extra_data": {"idempotency_key": submission.idempotency_key},
            });
            let response = self
                .client
                .post(format!("{}/prompt", endpoint.base_url()))
                .json(&body)
                .send()
                .await
                .map_err(classify_transport)?;
            let parsed: PromptResponse = Self::parse_response(response).await?;
            Ok(parsed.prompt_id)
        })
    }

    fn poll_status<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        job_id: &'a str,
    ) -> BoxFuture<'a, JobState, EngineError> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/history/{job_id}", endpoint.base_url()))
                .send()
                .await
                .map_err(classify_transport)?;
            let history: BTreeMap<String, HistoryEntry> = Self::parse_response(response).await?;
            Ok(interpret_history(job_id, history))
        })
    }

    fn fetch_artifact<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        descriptor: &'a OutputDescriptor,
    ) -> BoxFuture<'a, Artifact, EngineError> {
        Box::pin(async move {
            let response = self
                .client
                .get(format!("{}/view", endpoint.base_url()))
                .query(&[
                    ("filename", descriptor.filename.as_str()),
                    ("subfolder", descriptor.subfolder.as_str()),
                    ("type", descriptor.kind.as_str()),
                ])
                .send()
                .await
                .map_err(classify_transport)?;
            let checked = Self::ensure_success(response).await?;
            let content_type = checked
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_owned();
            let bytes = checked.bytes().await.map_err(classify_transport)?;
            Ok(Artifact {
                bytes: bytes.to_vec(),
                content_type,
            })
        })
    }
}
