//! Workflow engine abstraction for the application running inside an
//! instance.
//!
//! Jobs are opaque workflow graphs; this module only substitutes caller
//! parameters into them and models the engine's job lifecycle.

mod comfy;
mod graph;

use std::fmt;
use std::time::SystemTime;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::provider::{BoxFuture, InstanceAddress};

pub use comfy::ComfyEngine;
pub use graph::GraphError;
pub(crate) use graph::first_placeholder;

/// Base URL of an engine that has passed both readiness layers.
///
/// Only the readiness watcher mints an `Endpoint`, so holding one proves
/// the instance reached `Ready` before any job is submitted against it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    instance_id: String,
    base_url: String,
}

impl Endpoint {
    pub(crate) fn ready(instance_id: impl Into<String>, address: &InstanceAddress) -> Self {
        Self {
            instance_id: instance_id.into(),
            base_url: address.base_url(),
        }
    }

    /// Instance hosting the engine.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// HTTP base URL of the engine.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Declarative job supplied by the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSpec {
    /// Opaque workflow graph containing `{{name}}` placeholders.
    pub graph: Value,
    /// Values substituted into the graph before submission.
    pub params: Map<String, Value>,
    /// Caller-chosen key letting the engine deduplicate resubmissions.
    pub idempotency_key: String,
}

impl JobSpec {
    /// Parameter name used for the input artifact reference.
    pub const INPUT_PARAM: &'static str = "input";

    /// Creates a job with no substitution parameters.
    #[must_use]
    pub fn new(graph: Value, idempotency_key: impl Into<String>) -> Self {
        Self {
            graph,
            params: Map::new(),
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Sets the input artifact reference.
    #[must_use]
    pub fn with_input(self, reference: impl Into<String>) -> Self {
        self.with_param(Self::INPUT_PARAM, Value::String(reference.into()))
    }

    /// Sets a substitution parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Produces the engine payload by substituting every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] when the graph is not a JSON object or a
    /// placeholder has no matching parameter.
    pub fn render(&self) -> Result<Value, GraphError> {
        graph::render(&self.graph, &self.params)
    }
}

/// Rendered job ready for an engine.
#[derive(Clone, Debug, PartialEq)]
pub struct Submission {
    /// Graph with all parameters substituted.
    pub graph: Value,
    /// Caller-chosen idempotency key.
    pub idempotency_key: String,
}

/// Lifecycle of a submitted job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStatus {
    /// Accepted by the engine but not started.
    Queued,
    /// Currently executing.
    Running,
    /// Finished and produced outputs.
    Completed,
    /// The engine reported an explicit failure.
    Failed,
    /// No terminal state was observed within the budget.
    TimedOut,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed-out",
        };
        f.write_str(label)
    }
}

/// Handle to a job accepted by the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobHandle {
    /// Engine assigned job identifier.
    pub job_id: String,
    /// When the engine accepted the job.
    pub submitted_at: SystemTime,
    /// Last known status.
    pub status: JobStatus,
}

/// Reference to one output file produced by a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutputDescriptor {
    /// File name as reported by the engine.
    pub filename: String,
    /// Sub-directory within the engine's output area.
    pub subfolder: String,
    /// Storage area (`output`, `temp`, ...).
    pub kind: String,
}

/// Metadata of a completed job.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct JobResult {
    /// Output descriptors in engine order.
    pub outputs: Vec<OutputDescriptor>,
}

/// State reported by one status query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobState {
    /// The engine has no terminal record for the job yet.
    Pending,
    /// The engine reports the job as executing.
    Running,
    /// The job finished successfully.
    Completed(JobResult),
    /// The job failed with the engine's detail message.
    Failed(String),
}

/// Binary output retrieved from the engine.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Artifact {
    /// Raw payload, unmodified.
    pub bytes: Vec<u8>,
    /// MIME type reported by the engine.
    pub content_type: String,
}

/// Errors raised by engine adapters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum EngineError {
    /// The engine could not be reached at all.
    #[error("engine unreachable: {message}")]
    Connect {
        /// Transport error description.
        message: String,
    },
    /// The request failed after reaching the engine.
    #[error("engine request failed: {message}")]
    Transport {
        /// Transport error description.
        message: String,
    },
    /// The engine answered with a non-success status.
    #[error("engine API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
    /// The engine answered with a body that could not be decoded.
    #[error("failed to decode engine response: {message}")]
    Decode {
        /// Parser error description.
        message: String,
    },
}

impl EngineError {
    /// Returns `true` when the request never reached the engine and may be
    /// retried safely.
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}

/// Capability interface implemented by in-instance workflow engines.
pub trait WorkflowEngine: Send + Sync {
    /// Probes the application's own health call.
    fn health<'a>(&'a self, address: &'a InstanceAddress) -> BoxFuture<'a, (), EngineError>;

    /// Submits a rendered job and returns the engine's job identifier.
    fn submit<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        submission: &'a Submission,
    ) -> BoxFuture<'a, String, EngineError>;

    /// Queries the status of a job.
    fn poll_status<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        job_id: &'a str,
    ) -> BoxFuture<'a, JobState, EngineError>;

    /// Retrieves the binary output referenced by a descriptor.
    fn fetch_artifact<'a>(
        &'a self,
        endpoint: &'a Endpoint,
        descriptor: &'a OutputDescriptor,
    ) -> BoxFuture<'a, Artifact, EngineError>;
}
