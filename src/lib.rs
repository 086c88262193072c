//! Core library for the spotrun job orchestrator.
//!
//! A run rents the cheapest GPU offer that satisfies a set of constraints,
//! boots a workflow engine on it, submits one job, retrieves the primary
//! artifact and destroys the instance on every exit path
//! (select → provision → ready → submit → poll → fetch → destroy).
//!
//! The pipeline is written once against two capability traits,
//! [`ComputeProvider`] and [`WorkflowEngine`], so alternative marketplaces
//! and engines plug in without touching [`JobRunner`].

pub mod bootstrap;
pub mod config;
pub mod cost;
pub mod engine;
pub mod fetch;
pub mod files;
pub mod logging;
pub mod poller;
pub mod polling;
pub mod provider;
pub mod provision;
pub mod readiness;
pub mod run;
pub mod selector;
pub mod submit;
pub mod teardown;
pub mod test_support;

pub use bootstrap::{BootstrapContext, BootstrapError, BootstrapTemplate};
pub use config::{ConfigError, SpotrunConfig};
pub use cost::{CostReport, estimate};
pub use engine::{
    Artifact, ComfyEngine, EngineError, Endpoint, GraphError, JobHandle, JobResult, JobSpec,
    JobState, JobStatus, OutputDescriptor, WorkflowEngine,
};
pub use fetch::FetchError;
pub use poller::JobOutcome;
pub use polling::{Cancelled, PollError, PollPolicy};
pub use provider::{
    ComputeProvider, HttpProvider, HttpProviderConfig, Instance, InstanceAddress, InstanceStatus,
    Offer, ProviderError, ProvisionRequest,
};
pub use provision::{InstanceProvisioner, ProvisionError};
pub use readiness::{ReadinessError, ReadinessPhase, ReadinessPolicy};
pub use run::{ErrorKind, JobRunner, RunError, RunOutput, RunPhase, RunSettings};
pub use selector::{Constraints, CostCap, ResourceSelector, SelectError};
pub use submit::{SubmitError, SubmitPolicy};
pub use teardown::{TeardownError, TeardownGuard};
