//! Bounded polling of a submitted job until it reaches a terminal state.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Endpoint, JobResult, JobState, WorkflowEngine};
use crate::polling::{Cancelled, PollError, PollPolicy, Probe, poll_until};

/// Terminal outcome of a job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    /// The job finished and produced outputs.
    Completed(JobResult),
    /// The engine reported an explicit failure.
    Failed(String),
    /// No terminal state was observed within the budget.
    TimedOut {
        /// Time spent polling.
        waited: Duration,
    },
}

/// Polls `job_id` at a constant interval until it completes, fails, or
/// the policy's budget elapses.
///
/// Status queries that fail are logged and counted as a non-terminal poll,
/// so the worst-case wall clock stays `timeout + interval`.
///
/// # Errors
///
/// Returns [`Cancelled`] when `cancel` fires.
pub async fn await_completion<E>(
    engine: &E,
    endpoint: &Endpoint,
    job_id: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<JobOutcome, Cancelled>
where
    E: WorkflowEngine + ?Sized,
{
    let polled = poll_until(policy, cancel, |attempt| async move {
        match engine.poll_status(endpoint, job_id).await {
            Ok(JobState::Completed(result)) => Probe::Ready(result),
            Ok(JobState::Failed(detail)) => Probe::Abort(detail),
            Ok(state) => {
                debug!(job_id, attempt, ?state, "job not finished");
                Probe::Pending
            }
            Err(err) => {
                warn!(job_id, attempt, error = %err, "status query failed");
                Probe::Pending
            }
        }
    })
    .await;

    match polled {
        Ok(result) => {
            info!(job_id, outputs = result.outputs.len(), "job completed");
            Ok(JobOutcome::Completed(result))
        }
        Err(PollError::Aborted(detail)) => {
            warn!(job_id, %detail, "job failed");
            Ok(JobOutcome::Failed(detail))
        }
        Err(PollError::TimedOut { attempts, elapsed }) => {
            warn!(job_id, attempts, waited = ?elapsed, "job did not finish in time");
            Ok(JobOutcome::TimedOut { waited: elapsed })
        }
        Err(PollError::Cancelled(cancelled)) => Err(cancelled),
    }
}
