//! BDD step definitions for the `spotrun` run workflow.

use rstest_bdd_macros::{given, then, when};
use spotrun::test_support::{JobScript, ScriptedEngine, ScriptedProvider, offer};
use spotrun::{EngineError, RunOutput};
use tokio::runtime::Runtime;

use super::test_helpers::{RunContext, RunResult, healthy_catalog, run_once};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("offers priced \"{first}\", \"{second}\" and \"{third}\"")]
fn offers_priced(mut run_context: RunContext, first: f64, second: f64, third: f64) -> RunContext {
    run_context.provider = ScriptedProvider::with_offers(vec![
        offer("o-second", second, 24),
        offer("o-first", first, 24),
        offer("o-third", third, 24),
    ]);
    run_context
}

#[given("a price ceiling of \"{ceiling}\"")]
fn price_ceiling(mut run_context: RunContext, ceiling: f64) -> RunContext {
    run_context.constraints.price_ceiling = ceiling;
    run_context
}

#[given("a healthy catalog")]
fn catalog(mut run_context: RunContext) -> RunContext {
    run_context.provider = healthy_catalog();
    run_context
}

#[given("an engine that never becomes healthy")]
fn never_healthy(mut run_context: RunContext) -> RunContext {
    run_context.engine = ScriptedEngine::new().healthy_after(0);
    run_context
}

#[given("a job that fails on poll \"{poll}\" with \"{detail}\"")]
fn job_fails(mut run_context: RunContext, poll: u32, detail: String) -> RunContext {
    run_context.engine = ScriptedEngine::new().job(JobScript::FailOnPoll(poll, detail));
    run_context
}

#[given("a job that never finishes")]
fn job_runs_forever(mut run_context: RunContext) -> RunContext {
    run_context.engine = ScriptedEngine::new().job(JobScript::RunForever);
    run_context
}

#[given("the engine serves the artifact \"{payload}\"")]
fn engine_serves(mut run_context: RunContext, payload: String) -> RunContext {
    run_context.engine = ScriptedEngine::new().artifact(payload.into_bytes(), "image/png");
    run_context
}

#[given("an engine that rejects submissions")]
fn engine_rejects(mut run_context: RunContext) -> RunContext {
    run_context.engine = ScriptedEngine::new().failing_submit([EngineError::Api {
        status: 400,
        body: String::from("prompt has no outputs"),
    }]);
    run_context
}

#[given("a provider that fails to destroy instances")]
fn destroy_fails(mut run_context: RunContext) -> RunContext {
    run_context.provider = healthy_catalog().failing_destroy(1);
    run_context
}

#[when("I run the job")]
fn run_job(mut run_context: RunContext) -> Result<RunContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let outcome = runtime.block_on(run_once(&run_context));
    run_context.outcome = Some(outcome);
    Ok(run_context)
}

fn success(run_context: &RunContext) -> Result<&RunOutput, StepError> {
    match &run_context.outcome {
        Some(RunResult::Success(output)) => Ok(output),
        Some(RunResult::Failure(err)) => Err(StepError::Assertion(format!(
            "run failed unexpectedly: {err}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the run succeeds")]
fn run_succeeds(run_context: &RunContext) -> Result<(), StepError> {
    success(run_context).map(|_| ())
}

#[then("the selected offer costs \"{price}\" per hour")]
fn selected_price(run_context: &RunContext, price: f64) -> Result<(), StepError> {
    let output = success(run_context)?;
    if output.cost.price_per_hour.total_cmp(&price).is_eq() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected offer at {price}, got {}",
            output.cost.price_per_hour
        )))
    }
}

#[then("the artifact is \"{payload}\"")]
fn artifact_is(run_context: &RunContext, payload: String) -> Result<(), StepError> {
    let output = success(run_context)?;
    if output.artifact.bytes == payload.as_bytes() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "artifact bytes differ: {:?}",
            output.artifact.bytes
        )))
    }
}

#[then("the run fails with kind \"{kind}\"")]
fn run_fails_with(run_context: &RunContext, kind: String) -> Result<(), StepError> {
    match &run_context.outcome {
        Some(RunResult::Failure(err)) if err.kind().as_str() == kind => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {kind} failure, got {other:?}"
        ))),
    }
}

#[then("the failure mentions \"{detail}\"")]
fn failure_mentions(run_context: &RunContext, detail: String) -> Result<(), StepError> {
    match &run_context.outcome {
        Some(RunResult::Failure(err)) if err.to_string().contains(&detail) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected failure mentioning {detail}, got {other:?}"
        ))),
    }
}

#[then("the instance is destroyed exactly once")]
fn destroyed_once(run_context: &RunContext) -> Result<(), StepError> {
    let provider = &run_context.provider;
    if provider.destroy_calls() == 1 && provider.live_instances().is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one destroy call and no live instances, got {} calls and {:?}",
            provider.destroy_calls(),
            provider.live_instances()
        )))
    }
}

#[then("no instance was provisioned")]
fn nothing_provisioned(run_context: &RunContext) -> Result<(), StepError> {
    match run_context.provider.provision_calls() {
        0 => Ok(()),
        calls => Err(StepError::Assertion(format!(
            "expected no provision calls, got {calls}"
        ))),
    }
}

#[then("the teardown failure is reported")]
fn teardown_reported(run_context: &RunContext) -> Result<(), StepError> {
    let output = success(run_context)?;
    match &output.teardown_error {
        Some(err) if err.instance_id == output.instance_id => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected teardown failure for {}, got {other:?}",
            output.instance_id
        ))),
    }
}
