//! Job submission with bounded retry of pure connection failures.

use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{
    EngineError, Endpoint, GraphError, JobHandle, JobSpec, JobStatus, Submission, WorkflowEngine,
};
use crate::polling::Cancelled;

/// Default number of submission attempts.
pub const DEFAULT_SUBMIT_ATTEMPTS: u32 = 3;

/// Retry budget for submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubmitPolicy {
    /// Total attempts, including the first. Values below one are raised
    /// to one.
    pub attempts: u32,
    /// Delay before the second attempt; doubled after every retry.
    pub initial_backoff: Duration,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_SUBMIT_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Errors raised while submitting a job.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SubmitError {
    /// The graph could not be rendered; nothing was sent.
    #[error("workflow graph is invalid: {0}")]
    InvalidGraph(#[from] GraphError),
    /// The engine answered but refused the job.
    #[error("engine refused the job: {0}")]
    Rejected(#[source] EngineError),
    /// Every attempt failed to connect.
    #[error("engine unreachable after {attempts} attempts: {last}")]
    Unreachable {
        /// Attempts made.
        attempts: u32,
        /// Last connection error.
        last: EngineError,
    },
    /// The submission was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Renders `spec` and submits it to the ready engine at `endpoint`.
///
/// Only failures that never reached the engine are retried; anything the
/// engine answered is final.
///
/// # Errors
///
/// Returns [`SubmitError`] when the graph is malformed, the engine refuses
/// the job, every attempt fails to connect, or `cancel` fires.
pub async fn submit<E>(
    engine: &E,
    endpoint: &Endpoint,
    spec: &JobSpec,
    policy: SubmitPolicy,
    cancel: &CancellationToken,
) -> Result<JobHandle, SubmitError>
where
    E: WorkflowEngine + ?Sized,
{
    let submission = Submission {
        graph: spec.render()?,
        idempotency_key: spec.idempotency_key.clone(),
    };
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        let err = match engine.submit(endpoint, &submission).await {
            Ok(job_id) => {
                info!(%job_id, attempt, instance_id = endpoint.instance_id(), "job submitted");
                return Ok(JobHandle {
                    job_id,
                    submitted_at: SystemTime::now(),
                    status: JobStatus::Queued,
                });
            }
            Err(err) if err.is_connect() => err,
            Err(err) => return Err(SubmitError::Rejected(err)),
        };

        if attempt >= attempts {
            return Err(SubmitError::Unreachable {
                attempts,
                last: err,
            });
        }
        warn!(attempt, error = %err, delay = ?backoff, "submit failed to connect; retrying");
        tokio::select! {
            () = cancel.cancelled() => return Err(Cancelled.into()),
            () = sleep(backoff) => {}
        }
        backoff = backoff.saturating_mul(2);
        attempt += 1;
    }
}
