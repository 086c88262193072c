//! Retrieval of the primary output of a completed job.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Artifact, EngineError, Endpoint, JobResult, WorkflowEngine};
use crate::polling::Cancelled;

/// Retrieval attempts, including the first.
const FETCH_ATTEMPTS: u32 = 2;

/// Errors raised while retrieving an artifact.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FetchError {
    /// The job completed without output descriptors.
    #[error("job completed without outputs")]
    NoOutputs,
    /// The engine answered with an empty payload.
    #[error("engine returned an empty artifact for `{filename}`")]
    Empty {
        /// Output that came back empty.
        filename: String,
    },
    /// Every retrieval attempt failed.
    #[error("artifact retrieval failed: {0}")]
    Engine(#[source] EngineError),
    /// The retrieval was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Retrieves the first output of `result`, retrying once.
///
/// # Errors
///
/// Returns [`FetchError`] when there is nothing to fetch, both attempts
/// fail, or `cancel` fires.
pub async fn fetch<E>(
    engine: &E,
    endpoint: &Endpoint,
    result: &JobResult,
    cancel: &CancellationToken,
) -> Result<Artifact, FetchError>
where
    E: WorkflowEngine + ?Sized,
{
    let descriptor = result.outputs.first().ok_or(FetchError::NoOutputs)?;
    let mut attempt = 1;

    loop {
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled.into()),
            outcome = engine.fetch_artifact(endpoint, descriptor) => outcome,
        };
        let err = match outcome {
            Ok(artifact) if artifact.bytes.is_empty() => FetchError::Empty {
                filename: descriptor.filename.clone(),
            },
            Ok(artifact) => {
                info!(
                    filename = %descriptor.filename,
                    bytes = artifact.bytes.len(),
                    content_type = %artifact.content_type,
                    "artifact retrieved"
                );
                return Ok(artifact);
            }
            Err(err) => FetchError::Engine(err),
        };
        if attempt >= FETCH_ATTEMPTS {
            return Err(err);
        }
        warn!(
            attempt,
            filename = %descriptor.filename,
            error = %err,
            "artifact retrieval failed; retrying"
        );
        attempt += 1;
    }
}
