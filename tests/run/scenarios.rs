//! BDD scenarios for the run workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RunContext, run_context};

#[scenario(
    path = "tests/features/run.feature",
    name = "Select the cheapest offer within the price ceiling"
)]
fn scenario_select_cheapest(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Report a readiness timeout when the engine never answers"
)]
fn scenario_readiness_timeout(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Surface the engine failure detail"
)]
fn scenario_job_failure(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Return the artifact bytes unmodified"
)]
fn scenario_artifact_fidelity(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Tear down after a submission failure"
)]
fn scenario_submit_failure(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Tear down after a job timeout"
)]
fn scenario_job_timeout(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Never provision when no offer fits"
)]
fn scenario_no_offer(run_context: RunContext) {
    drop(run_context);
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Keep the artifact when teardown fails"
)]
fn scenario_teardown_failure(run_context: RunContext) {
    drop(run_context);
}
