//! Orchestrates one job on one ephemeral instance.
//!
//! The run selects an offer, provisions an instance, waits for both
//! readiness layers, submits the job, polls it to a terminal state and
//! fetches the artifact. Everything after a successful provision runs
//! under a [`TeardownGuard`], which is released before any result is
//! returned to the caller. Teardown failures are logged and reported
//! alongside a successful result; they never replace a run error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::bootstrap::BootstrapTemplate;
use crate::cost::CostReport;
use crate::engine::{Artifact, JobHandle, JobSpec, JobStatus, WorkflowEngine};
use crate::fetch::{FetchError, fetch};
use crate::poller::{JobOutcome, await_completion};
use crate::polling::{Cancelled, PollPolicy};
use crate::provider::{ComputeProvider, Offer, ProviderError};
use crate::provision::{InstanceProvisioner, ProvisionError};
use crate::readiness::{ReadinessError, ReadinessPolicy, wait_healthy, wait_running};
use crate::selector::{Constraints, ResourceSelector, SelectError};
use crate::submit::{SubmitError, SubmitPolicy, submit};
use crate::teardown::{TeardownError, TeardownGuard};

/// Port the engine listens on unless configured otherwise.
pub const DEFAULT_ENGINE_PORT: u16 = 8188;

/// Stage of a run, recorded in logs as the run progresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RunPhase {
    /// Querying the catalog.
    Selecting,
    /// Creating the instance.
    Provisioning,
    /// Waiting for the provider to report running.
    AwaitingInfraReady,
    /// Waiting for the engine to answer its health call.
    AwaitingAppReady,
    /// Sending the job.
    Submitting,
    /// Polling the job.
    AwaitingJobCompletion,
    /// Retrieving the artifact.
    Fetching,
    /// Destroying the instance.
    TearingDown,
    /// Finished successfully.
    Done,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Selecting => "selecting",
            Self::Provisioning => "provisioning",
            Self::AwaitingInfraReady => "awaiting-infra-ready",
            Self::AwaitingAppReady => "awaiting-app-ready",
            Self::Submitting => "submitting",
            Self::AwaitingJobCompletion => "awaiting-job-completion",
            Self::Fetching => "fetching",
            Self::TearingDown => "tearing-down",
            Self::Done => "done",
        };
        f.write_str(label)
    }
}

/// Stable classification of run failures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// No offer met the constraints; nothing was billed.
    ResourceUnavailable,
    /// The offer catalog could not be queried; nothing was billed.
    ProviderUnavailable,
    /// The instance could not be created or failed while booting.
    ProvisionFailure,
    /// A readiness layer did not become ready in time.
    ReadinessTimeout,
    /// The job could not be submitted.
    SubmitFailure,
    /// The engine reported the job as failed.
    JobFailure,
    /// The job did not reach a terminal state in time.
    JobTimeout,
    /// The artifact could not be retrieved.
    FetchFailure,
    /// The caller cancelled the run.
    Cancelled,
}

impl ErrorKind {
    /// Stable identifier for logs and callers.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResourceUnavailable => "resource_unavailable",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProvisionFailure => "provision_failure",
            Self::ReadinessTimeout => "readiness_timeout",
            Self::SubmitFailure => "submit_failure",
            Self::JobFailure => "job_failure",
            Self::JobTimeout => "job_timeout",
            Self::FetchFailure => "fetch_failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by a run. Every variant past selection was reported
/// only after the instance was torn down.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum RunError {
    /// No offer satisfies the constraints.
    #[error("no offer satisfies {constraints} ({considered} offers considered)")]
    ResourceUnavailable {
        /// Rendered constraints.
        constraints: String,
        /// Offers in the catalog.
        considered: usize,
    },
    /// The offer catalog could not be queried.
    #[error("offer catalog unavailable: {0}")]
    Catalog(#[source] ProviderError),
    /// The instance could not be created.
    #[error("provisioning failed: {0}")]
    Provision(#[source] ProvisionError),
    /// The instance never became ready.
    #[error("instance never became ready: {0}")]
    Readiness(#[source] ReadinessError),
    /// The job could not be submitted.
    #[error("job submission failed: {0}")]
    Submit(#[source] SubmitError),
    /// The engine reported the job as failed.
    #[error("job {job_id} failed: {detail}")]
    JobFailure {
        /// Engine job identifier.
        job_id: String,
        /// Engine failure detail.
        detail: String,
    },
    /// The job did not finish within its budget.
    #[error("job {job_id} did not finish within {}s", waited.as_secs())]
    JobTimeout {
        /// Engine job identifier.
        job_id: String,
        /// Time spent polling.
        waited: Duration,
    },
    /// The artifact could not be retrieved.
    #[error("artifact retrieval failed: {0}")]
    Fetch(#[source] FetchError),
    /// The run was cancelled.
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    /// Classifies the failure.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            Self::Catalog(_) => ErrorKind::ProviderUnavailable,
            Self::Provision(_) | Self::Readiness(ReadinessError::InstanceFailed { .. }) => {
                ErrorKind::ProvisionFailure
            }
            Self::Readiness(_) => ErrorKind::ReadinessTimeout,
            Self::Submit(_) => ErrorKind::SubmitFailure,
            Self::JobFailure { .. } => ErrorKind::JobFailure,
            Self::JobTimeout { .. } => ErrorKind::JobTimeout,
            Self::Fetch(_) => ErrorKind::FetchFailure,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<SelectError> for RunError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::Unavailable {
                constraints,
                considered,
            } => Self::ResourceUnavailable {
                constraints,
                considered,
            },
            SelectError::Catalog(source) => Self::Catalog(source),
        }
    }
}

impl From<Cancelled> for RunError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<ProvisionError> for RunError {
    fn from(err: ProvisionError) -> Self {
        Self::Provision(err)
    }
}

impl From<ReadinessError> for RunError {
    fn from(err: ReadinessError) -> Self {
        match err {
            ReadinessError::Cancelled(_) => Self::Cancelled,
            other => Self::Readiness(other),
        }
    }
}

impl From<SubmitError> for RunError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Cancelled(_) => Self::Cancelled,
            other => Self::Submit(other),
        }
    }
}

impl From<FetchError> for RunError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Cancelled(_) => Self::Cancelled,
            other => Self::Fetch(other),
        }
    }
}

/// Budgets and knobs for every phase of a run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RunSettings {
    /// Readiness budgets.
    pub readiness: ReadinessPolicy,
    /// Job polling budget.
    pub job: PollPolicy,
    /// Submission retry budget.
    pub submit: SubmitPolicy,
    /// Port the engine listens on inside the instance.
    pub engine_port: u16,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            readiness: ReadinessPolicy {
                infra: PollPolicy::new(Duration::from_secs(10), Duration::from_secs(600)),
                app: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
            },
            job: PollPolicy::new(Duration::from_secs(5), Duration::from_secs(1800)),
            submit: SubmitPolicy::default(),
            engine_port: DEFAULT_ENGINE_PORT,
        }
    }
}

impl RunSettings {
    /// Longest time a run can keep an instance alive before teardown,
    /// excluding request latencies. Used for pre-flight cost caps.
    #[must_use]
    pub fn billable_budget(&self) -> Duration {
        [self.readiness.infra, self.readiness.app, self.job]
            .iter()
            .fold(Duration::ZERO, |total, policy| {
                total
                    .saturating_add(policy.timeout)
                    .saturating_add(policy.interval)
            })
    }
}

/// Result of a successful run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutput {
    /// Retrieved artifact.
    pub artifact: Artifact,
    /// Realised cost from provisioning to teardown.
    pub cost: CostReport,
    /// Handle of the completed job.
    pub job: JobHandle,
    /// Instance the job ran on (already destroyed, or logged if not).
    pub instance_id: String,
    /// Set when destroying the instance failed; the instance may still be
    /// billing.
    pub teardown_error: Option<TeardownError>,
}

/// Runs jobs against a provider and engine.
#[derive(Debug)]
pub struct JobRunner<P: ComputeProvider + ?Sized + 'static, E> {
    provider: Arc<P>,
    engine: E,
    template: BootstrapTemplate,
    settings: RunSettings,
}

impl<P, E> JobRunner<P, E>
where
    P: ComputeProvider + ?Sized + 'static,
    E: WorkflowEngine,
{
    /// Creates a runner with the built-in bootstrap template and default
    /// budgets.
    #[must_use]
    pub fn new(provider: Arc<P>, engine: E) -> Self {
        Self {
            provider,
            engine,
            template: BootstrapTemplate::default(),
            settings: RunSettings::default(),
        }
    }

    /// Replaces the bootstrap template.
    #[must_use]
    pub fn with_template(mut self, template: BootstrapTemplate) -> Self {
        self.template = template;
        self
    }

    /// Replaces the phase budgets.
    #[must_use]
    pub const fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Phase budgets in effect.
    #[must_use]
    pub const fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Runs `spec` on the cheapest offer satisfying `constraints`.
    ///
    /// The instance is destroyed before this returns, whatever the
    /// outcome. Cancelling `cancel` interrupts any waiting phase; the
    /// instance is still destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] describing the first failure; see
    /// [`RunError::kind`] for its classification.
    pub async fn run_job(
        &self,
        spec: &JobSpec,
        constraints: &Constraints,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunError> {
        let run_id = Uuid::new_v4();
        self.run_labelled(spec, constraints, cancel, &format!("spotrun-{run_id}"))
            .instrument(info_span!("run", %run_id))
            .await
    }

    async fn run_labelled(
        &self,
        spec: &JobSpec,
        constraints: &Constraints,
        cancel: &CancellationToken,
        label: &str,
    ) -> Result<RunOutput, RunError> {
        enter(RunPhase::Selecting);
        let selector = ResourceSelector::new(&*self.provider);
        let offer = tokio::select! {
            () = cancel.cancelled() => return Err(RunError::Cancelled),
            selected = selector.select(constraints) => selected?,
        };
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        enter(RunPhase::Provisioning);
        let started = Instant::now();
        let instance = InstanceProvisioner::new(
            &*self.provider,
            &self.template,
            self.settings.engine_port,
        )
        .provision(&offer, label)
        .await?;
        let guard = TeardownGuard::arm(Arc::clone(&self.provider), instance.id.clone());

        let outcome = self.drive(&instance.id, spec, cancel).await;

        enter(RunPhase::TearingDown);
        let teardown_error = guard.release().await.err();
        let cost = CostReport::new(&offer, started.elapsed());
        finish(&offer, &instance.id, outcome, cost, teardown_error)
    }

    async fn drive(
        &self,
        instance_id: &str,
        spec: &JobSpec,
        cancel: &CancellationToken,
    ) -> Result<(Artifact, JobHandle), RunError> {
        let settings = &self.settings;

        enter(RunPhase::AwaitingInfraReady);
        let address =
            wait_running(&*self.provider, instance_id, settings.readiness.infra, cancel).await?;

        enter(RunPhase::AwaitingAppReady);
        let endpoint = wait_healthy(
            &self.engine,
            instance_id,
            &address,
            settings.readiness.app,
            cancel,
        )
        .await?;

        enter(RunPhase::Submitting);
        let mut job = submit(&self.engine, &endpoint, spec, settings.submit, cancel).await?;

        enter(RunPhase::AwaitingJobCompletion);
        let outcome =
            await_completion(&self.engine, &endpoint, &job.job_id, settings.job, cancel).await?;
        let result = match outcome {
            JobOutcome::Completed(result) => result,
            JobOutcome::Failed(detail) => {
                return Err(RunError::JobFailure {
                    job_id: job.job_id,
                    detail,
                });
            }
            JobOutcome::TimedOut { waited } => {
                return Err(RunError::JobTimeout {
                    job_id: job.job_id,
                    waited,
                });
            }
        };
        job.status = JobStatus::Completed;

        enter(RunPhase::Fetching);
        let artifact = fetch(&self.engine, &endpoint, &result, cancel).await?;
        Ok((artifact, job))
    }
}

fn enter(phase: RunPhase) {
    info!(%phase, "entering phase");
}

fn finish(
    offer: &Offer,
    instance_id: &str,
    outcome: Result<(Artifact, JobHandle), RunError>,
    cost: CostReport,
    teardown_error: Option<TeardownError>,
) -> Result<RunOutput, RunError> {
    match outcome {
        Ok((artifact, job)) => {
            if teardown_error.is_some() {
                warn!(instance_id, "run succeeded but teardown failed");
            }
            enter(RunPhase::Done);
            info!(
                offer_id = %offer.id,
                instance_id,
                job_id = %job.job_id,
                estimated_cost = cost.estimated_cost,
                elapsed_seconds = cost.elapsed_seconds,
                "run complete"
            );
            Ok(RunOutput {
                artifact,
                cost,
                job,
                instance_id: instance_id.to_owned(),
                teardown_error,
            })
        }
        Err(err) => {
            error!(
                kind = %err.kind(),
                error = %err,
                offer_id = %offer.id,
                instance_id,
                estimated_cost = cost.estimated_cost,
                "run failed"
            );
            Err(err)
        }
    }
}
