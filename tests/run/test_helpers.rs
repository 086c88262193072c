//! Shared fixtures for run BDD scenarios.

use std::sync::Arc;
use std::time::Duration;

use rstest::fixture;
use spotrun::test_support::{ScriptedEngine, ScriptedProvider, offer};
use spotrun::{
    Constraints, JobRunner, JobSpec, PollPolicy, ReadinessPolicy, RunError, RunOutput,
    RunSettings, SubmitPolicy,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct RunContext {
    pub provider: ScriptedProvider,
    pub engine: ScriptedEngine,
    pub constraints: Constraints,
    pub outcome: Option<RunResult>,
}

#[derive(Clone, Debug)]
pub enum RunResult {
    Success(RunOutput),
    Failure(RunError),
}

#[fixture]
pub fn run_context() -> RunContext {
    RunContext {
        provider: ScriptedProvider::default(),
        engine: ScriptedEngine::new(),
        constraints: Constraints::new(8, 1.0),
        outcome: None,
    }
}

/// Offers that all satisfy the default constraints.
pub fn healthy_catalog() -> ScriptedProvider {
    ScriptedProvider::with_offers(vec![offer("o-1", 0.40, 24), offer("o-2", 0.55, 24)])
}

/// Short budgets so failing scenarios finish quickly in real time.
pub fn fast_settings() -> RunSettings {
    let poll = PollPolicy::new(Duration::from_millis(10), Duration::from_millis(200));
    RunSettings {
        readiness: ReadinessPolicy {
            infra: poll,
            app: poll,
        },
        job: poll,
        submit: SubmitPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
        },
        engine_port: 8188,
    }
}

pub async fn run_once(context: &RunContext) -> RunResult {
    let spec = JobSpec::new(
        serde_json::json!({"3": {"class_type": "KSampler", "inputs": {"seed": 7}}}),
        "bdd-run",
    );
    let runner = JobRunner::new(Arc::new(context.provider.clone()), context.engine.clone())
        .with_settings(fast_settings());
    match runner
        .run_job(&spec, &context.constraints, &CancellationToken::new())
        .await
    {
        Ok(output) => RunResult::Success(output),
        Err(err) => RunResult::Failure(err),
    }
}
