//! Two-layer readiness detection.
//!
//! Phase A polls the provider until the instance reports running with a
//! reachable address. Phase B then probes the engine's own health call,
//! because infrastructure readiness says nothing about the application
//! having finished loading. Only when both succeed is an [`Endpoint`]
//! minted.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::{Endpoint, WorkflowEngine};
use crate::polling::{Cancelled, PollError, PollPolicy, Probe, poll_until};
use crate::provider::{ComputeProvider, InstanceAddress, InstanceStatus};

/// Readiness layer that failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadinessPhase {
    /// The provider never reported the instance as running.
    Infrastructure,
    /// The engine never answered its health call.
    Application,
}

impl std::fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Infrastructure => "infrastructure",
            Self::Application => "application",
        })
    }
}

/// Polling budgets for both readiness layers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessPolicy {
    /// Outer budget for the provider to report running.
    pub infra: PollPolicy,
    /// Inner budget for the engine to answer its health call.
    pub app: PollPolicy,
}

/// Errors raised while waiting for an instance to become ready.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReadinessError {
    /// A phase exhausted its budget.
    #[error("{phase} readiness timed out after {attempts} checks over {}s", waited.as_secs())]
    TimedOut {
        /// Phase that timed out.
        phase: ReadinessPhase,
        /// Number of checks issued.
        attempts: u32,
        /// Time spent in the phase.
        waited: Duration,
    },
    /// The provider reported the instance as failed or stopped.
    #[error("instance {instance_id} entered state {status} while booting")]
    InstanceFailed {
        /// Instance that failed.
        instance_id: String,
        /// Terminal status reported.
        status: InstanceStatus,
    },
    /// The wait was cancelled.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl ReadinessError {
    fn from_poll(phase: ReadinessPhase, err: PollError<Self>) -> Self {
        match err {
            PollError::TimedOut { attempts, elapsed } => Self::TimedOut {
                phase,
                attempts,
                waited: elapsed,
            },
            PollError::Cancelled(cancelled) => Self::Cancelled(cancelled),
            PollError::Aborted(inner) => inner,
        }
    }
}

/// Waits until `instance_id` is running and its engine is healthy.
///
/// # Errors
///
/// Returns [`ReadinessError`] when either phase times out, the instance
/// fails while booting, or `cancel` fires.
pub async fn wait_ready<P, E>(
    provider: &P,
    engine: &E,
    instance_id: &str,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<Endpoint, ReadinessError>
where
    P: ComputeProvider + ?Sized,
    E: WorkflowEngine + ?Sized,
{
    let address = wait_running(provider, instance_id, policy.infra, cancel).await?;
    wait_healthy(engine, instance_id, &address, policy.app, cancel).await
}

/// Polls the provider until the instance is running with an address.
///
/// A `failed` or `stopped` status ends the wait early. Describe errors are
/// logged and count as a pending check.
///
/// # Errors
///
/// Returns [`ReadinessError`] on timeout, boot failure, or cancellation.
pub async fn wait_running<P>(
    provider: &P,
    instance_id: &str,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<InstanceAddress, ReadinessError>
where
    P: ComputeProvider + ?Sized,
{
    let address = poll_until(policy, cancel, |attempt| async move {
        match provider.describe(instance_id).await {
            Ok(instance) if instance.status.is_terminal() => {
                Probe::Abort(ReadinessError::InstanceFailed {
                    instance_id: instance_id.to_owned(),
                    status: instance.status,
                })
            }
            Ok(instance) if instance.status.is_running() => {
                instance.address.map_or(Probe::Pending, Probe::Ready)
            }
            Ok(instance) => {
                debug!(instance_id, attempt, status = %instance.status, "instance not running");
                Probe::Pending
            }
            Err(err) => {
                debug!(instance_id, attempt, error = %err, "describe failed; retrying");
                Probe::Pending
            }
        }
    })
    .await
    .map_err(|err| ReadinessError::from_poll(ReadinessPhase::Infrastructure, err))?;

    info!(instance_id, host = %address.host, port = address.port, "instance running");
    Ok(address)
}

/// Probes the engine at `address` until its health call succeeds, then
/// mints the [`Endpoint`] jobs are submitted against.
///
/// # Errors
///
/// Returns [`ReadinessError`] on timeout or cancellation.
pub async fn wait_healthy<E>(
    engine: &E,
    instance_id: &str,
    address: &InstanceAddress,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<Endpoint, ReadinessError>
where
    E: WorkflowEngine + ?Sized,
{
    poll_until(policy, cancel, |attempt| async move {
        match engine.health(address).await {
            Ok(()) => Probe::Ready(()),
            Err(err) => {
                debug!(instance_id, attempt, error = %err, "health probe failed");
                Probe::Pending
            }
        }
    })
    .await
    .map_err(|err| ReadinessError::from_poll(ReadinessPhase::Application, err))?;

    info!(instance_id, "engine healthy");
    Ok(Endpoint::ready(instance_id, address))
}
