//! Test support utilities shared across unit and integration tests.
//!
//! [`ScriptedProvider`] and [`ScriptedEngine`] replay pre-seeded behaviour
//! and count every call so tests can assert on side effects such as the
//! number of destroy requests issued for a run.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use crate::engine::{
    Artifact, EngineError, Endpoint, JobResult, JobState, OutputDescriptor, Submission,
    WorkflowEngine,
};
use crate::provider::{
    BoxFuture, ComputeProvider, Instance, InstanceAddress, InstanceStatus, Offer,
    ProviderError, ProvisionRequest,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builds an offer with the given price and memory for tests.
#[must_use]
pub fn offer(id: &str, price_per_hour: f64, gpu_memory_gb: u32) -> Offer {
    Offer {
        id: id.to_owned(),
        price_per_hour,
        gpu_memory_gb,
        compute_class: String::from("rtx4090"),
        reliability: 0.99,
    }
}

/// Behaviour of [`ScriptedProvider::provision`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProvisionScript {
    /// Create the instance and answer normally.
    Accept,
    /// Create the instance but lose the response.
    AcceptThenLoseResponse,
    /// Lose the request before it is applied.
    LoseRequest,
    /// Reject the request with an API error.
    Reject,
}

#[derive(Debug)]
struct ProviderState {
    offers: Vec<Offer>,
    provision: ProvisionScript,
    running_after: u32,
    fail_on_boot: bool,
    address: InstanceAddress,
    destroy_failures: u32,
    lookup_failures: u32,
    provision_delay: Duration,
    instances: Vec<Instance>,
    describe_calls: u32,
    provision_calls: u32,
    lookup_calls: u32,
    destroy_calls: u32,
    destroyed: Vec<String>,
}

/// Scripted compute provider that keeps instances in memory.
#[derive(Clone, Debug)]
pub struct ScriptedProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::with_offers(Vec::new())
    }
}

impl ScriptedProvider {
    /// Creates a provider exposing `offers` whose instances report
    /// running on the first describe call.
    #[must_use]
    pub fn with_offers(offers: Vec<Offer>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState {
                offers,
                provision: ProvisionScript::Accept,
                running_after: 1,
                fail_on_boot: false,
                address: InstanceAddress {
                    host: String::from("127.0.0.1"),
                    port: 8188,
                },
                destroy_failures: 0,
                lookup_failures: 0,
                provision_delay: Duration::ZERO,
                instances: Vec::new(),
                describe_calls: 0,
                provision_calls: 0,
                lookup_calls: 0,
                destroy_calls: 0,
                destroyed: Vec::new(),
            })),
        }
    }

    /// Sets the behaviour of the next provision calls.
    #[must_use]
    pub fn provisioning(self, script: ProvisionScript) -> Self {
        lock(&self.state).provision = script;
        self
    }

    /// Reports running only from the `describes`-th describe call onward.
    /// Zero means the instance never reports running.
    #[must_use]
    pub fn running_after(self, describes: u32) -> Self {
        lock(&self.state).running_after = describes;
        self
    }

    /// Makes instances report `failed` while booting.
    #[must_use]
    pub fn failing_on_boot(self) -> Self {
        lock(&self.state).fail_on_boot = true;
        self
    }

    /// Makes the first `count` destroy calls fail with an API error.
    #[must_use]
    pub fn failing_destroy(self, count: u32) -> Self {
        lock(&self.state).destroy_failures = count;
        self
    }

    /// Makes the first `count` label lookups fail as if the response
    /// was lost.
    #[must_use]
    pub fn failing_lookups(self, count: u32) -> Self {
        lock(&self.state).lookup_failures = count;
        self
    }

    /// Holds every provision call for `delay` before it is applied.
    #[must_use]
    pub fn provision_delay(self, delay: Duration) -> Self {
        lock(&self.state).provision_delay = delay;
        self
    }

    /// Number of provision calls issued.
    #[must_use]
    pub fn provision_calls(&self) -> u32 {
        lock(&self.state).provision_calls
    }

    /// Number of label lookups issued, successful or not.
    #[must_use]
    pub fn lookup_calls(&self) -> u32 {
        lock(&self.state).lookup_calls
    }

    /// Number of describe calls issued.
    #[must_use]
    pub fn describe_calls(&self) -> u32 {
        lock(&self.state).describe_calls
    }

    /// Number of destroy calls issued, successful or not.
    #[must_use]
    pub fn destroy_calls(&self) -> u32 {
        lock(&self.state).destroy_calls
    }

    /// Identifiers of instances destroyed successfully.
    #[must_use]
    pub fn destroyed(&self) -> Vec<String> {
        lock(&self.state).destroyed.clone()
    }

    /// Identifiers of instances that exist and have not been destroyed.
    #[must_use]
    pub fn live_instances(&self) -> Vec<String> {
        lock(&self.state)
            .instances
            .iter()
            .map(|instance| instance.id.clone())
            .collect()
    }
}

fn create_instance(state: &mut ProviderState, request: &ProvisionRequest) -> Instance {
    let instance = Instance {
        id: format!("inst-{}", state.provision_calls),
        status: InstanceStatus::Requesting,
        address: None,
        label: Some(request.label.clone()),
        created_at: SystemTime::now(),
    };
    state.instances.push(instance.clone());
    instance
}

impl ComputeProvider for ScriptedProvider {
    fn list_offers(&self) -> BoxFuture<'_, Vec<Offer>, ProviderError> {
        Box::pin(async move { Ok(lock(&self.state).offers.clone()) })
    }

    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> BoxFuture<'a, Instance, ProviderError> {
        Box::pin(async move {
            let delay = lock(&self.state).provision_delay;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut state = lock(&self.state);
            state.provision_calls = state.provision_calls.saturating_add(1);
            match state.provision.clone() {
                ProvisionScript::Accept => Ok(create_instance(&mut state, request)),
                ProvisionScript::AcceptThenLoseResponse => {
                    create_instance(&mut state, request);
                    Err(ProviderError::Ambiguous {
                        message: String::from("response lost"),
                    })
                }
                ProvisionScript::LoseRequest => Err(ProviderError::Ambiguous {
                    message: String::from("request lost"),
                }),
                ProvisionScript::Reject => Err(ProviderError::Api {
                    status: 409,
                    body: String::from("offer no longer available"),
                }),
            }
        })
    }

    fn describe<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Instance, ProviderError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.describe_calls = state.describe_calls.saturating_add(1);
            let calls = state.describe_calls;
            let running = state.running_after != 0 && calls >= state.running_after;
            let failed = state.fail_on_boot;
            let address = state.address.clone();
            let Some(instance) = state
                .instances
                .iter_mut()
                .find(|instance| instance.id == instance_id)
            else {
                return Err(ProviderError::NotFound {
                    instance_id: instance_id.to_owned(),
                });
            };
            if failed {
                instance.status = InstanceStatus::Failed;
            } else if running {
                instance.status = InstanceStatus::Running;
                instance.address = Some(address);
            } else {
                instance.status = InstanceStatus::Provisioning;
            }
            Ok(instance.clone())
        })
    }

    fn list_instances<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Vec<Instance>, ProviderError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.lookup_calls = state.lookup_calls.saturating_add(1);
            if state.lookup_failures > 0 {
                state.lookup_failures -= 1;
                return Err(ProviderError::Ambiguous {
                    message: String::from("lookup response lost"),
                });
            }
            Ok(state
                .instances
                .iter()
                .filter(|instance| instance.label.as_deref() == Some(label))
                .cloned()
                .collect())
        })
    }

    fn destroy<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, (), ProviderError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.destroy_calls = state.destroy_calls.saturating_add(1);
            if state.destroy_failures > 0 {
                state.destroy_failures -= 1;
                return Err(ProviderError::Api {
                    status: 500,
                    body: String::from("destroy failed"),
                });
            }
            let before = state.instances.len();
            state.instances.retain(|instance| instance.id != instance_id);
            if state.instances.len() == before {
                return Err(ProviderError::NotFound {
                    instance_id: instance_id.to_owned(),
                });
            }
            state.destroyed.push(instance_id.to_owned());
            Ok(())
        })
    }
}

/// Behaviour of [`ScriptedEngine::poll_status`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobScript {
    /// Report completion on the given poll.
    CompleteOnPoll(u32),
    /// Report failure with `detail` on the given poll.
    FailOnPoll(u32, String),
    /// Never reach a terminal state.
    RunForever,
}

#[derive(Debug)]
struct EngineState {
    healthy_after: u32,
    submit_failures: VecDeque<EngineError>,
    job: JobScript,
    outputs: Vec<OutputDescriptor>,
    artifact: Artifact,
    fetch_failures: u32,
    stall: Duration,
    health_calls: u32,
    submit_calls: u32,
    poll_calls: u32,
    fetch_calls: u32,
    submissions: Vec<Submission>,
}

/// Scripted workflow engine.
#[derive(Clone, Debug)]
pub struct ScriptedEngine {
    state: Arc<Mutex<EngineState>>,
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedEngine {
    /// Creates an engine that is healthy immediately, completes every job
    /// on the first poll and serves a small PNG payload.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(EngineState {
                healthy_after: 1,
                submit_failures: VecDeque::new(),
                job: JobScript::CompleteOnPoll(1),
                outputs: vec![OutputDescriptor {
                    filename: String::from("out_00001_.png"),
                    subfolder: String::new(),
                    kind: String::from("output"),
                }],
                artifact: Artifact {
                    bytes: vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a],
                    content_type: String::from("image/png"),
                },
                fetch_failures: 0,
                stall: Duration::ZERO,
                health_calls: 0,
                submit_calls: 0,
                poll_calls: 0,
                fetch_calls: 0,
                submissions: Vec::new(),
            })),
        }
    }

    /// Answers health probes only from the `probes`-th call onward. Zero
    /// means the engine never becomes healthy.
    #[must_use]
    pub fn healthy_after(self, probes: u32) -> Self {
        lock(&self.state).healthy_after = probes;
        self
    }

    /// Queues errors returned by successive submit calls.
    #[must_use]
    pub fn failing_submit(self, errors: impl IntoIterator<Item = EngineError>) -> Self {
        lock(&self.state).submit_failures.extend(errors);
        self
    }

    /// Sets the job lifecycle reported by status polls.
    #[must_use]
    pub fn job(self, script: JobScript) -> Self {
        lock(&self.state).job = script;
        self
    }

    /// Sets the outputs reported on completion.
    #[must_use]
    pub fn outputs(self, outputs: Vec<OutputDescriptor>) -> Self {
        lock(&self.state).outputs = outputs;
        self
    }

    /// Sets the artifact served for every output.
    #[must_use]
    pub fn artifact(self, bytes: Vec<u8>, content_type: &str) -> Self {
        lock(&self.state).artifact = Artifact {
            bytes,
            content_type: content_type.to_owned(),
        };
        self
    }

    /// Makes the first `count` fetch calls fail with a transport error.
    #[must_use]
    pub fn failing_fetch(self, count: u32) -> Self {
        lock(&self.state).fetch_failures = count;
        self
    }

    /// Holds every health check and status poll for `delay` before it
    /// answers, like a server that accepted the connection and went quiet.
    #[must_use]
    pub fn stalling(self, delay: Duration) -> Self {
        lock(&self.state).stall = delay;
        self
    }

    /// Number of health probes issued.
    #[must_use]
    pub fn health_calls(&self) -> u32 {
        lock(&self.state).health_calls
    }

    /// Number of submit calls issued.
    #[must_use]
    pub fn submit_calls(&self) -> u32 {
        lock(&self.state).submit_calls
    }

    /// Number of status polls issued.
    #[must_use]
    pub fn poll_calls(&self) -> u32 {
        lock(&self.state).poll_calls
    }

    /// Number of fetch calls issued.
    #[must_use]
    pub fn fetch_calls(&self) -> u32 {
        lock(&self.state).fetch_calls
    }

    /// Submissions received, in order.
    #[must_use]
    pub fn submissions(&self) -> Vec<Submission> {
        lock(&self.state).submissions.clone()
    }
}

async fn stall(state: &Mutex<EngineState>) {
    let delay = lock(state).stall;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

impl WorkflowEngine for ScriptedEngine {
    fn health<'a>(&'a self, _address: &'a InstanceAddress) -> BoxFuture<'a, (), EngineError> {
        Box::pin(async move {
            stall(&self.state).await;
            let mut state = lock(&self.state);
            state.health_calls = state.health_calls.saturating_add(1);
            if state.healthy_after != 0 && state.health_calls >= state.healthy_after {
                Ok(())
            } else {
                Err(EngineError::Connect {
                    message: String::from("connection refused"),
                })
            }
        })
    }

    fn submit<'a>(
        &'a self,
        _endpoint: &'a Endpoint,
        submission: &'a Submission,
    ) -> BoxFuture<'a, String, EngineError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.submit_calls = state.submit_calls.saturating_add(1);
            state.submissions.push(submission.clone());
            if let Some(err) = state.submit_failures.pop_front() {
                return Err(err);
            }
            Ok(format!("job-{}", state.submit_calls))
        })
    }

    fn poll_status<'a>(
        &'a self,
        _endpoint: &'a Endpoint,
        _job_id: &'a str,
    ) -> BoxFuture<'a, JobState, EngineError> {
        Box::pin(async move {
            stall(&self.state).await;
            let mut state = lock(&self.state);
            state.poll_calls = state.poll_calls.saturating_add(1);
            let polls = state.poll_calls;
            let job_state = match &state.job {
                JobScript::CompleteOnPoll(on) if polls >= *on => JobState::Completed(JobResult {
                    outputs: state.outputs.clone(),
                }),
                JobScript::FailOnPoll(on, detail) if polls >= *on => {
                    JobState::Failed(detail.clone())
                }
                _ if polls == 1 => JobState::Pending,
                _ => JobState::Running,
            };
            Ok(job_state)
        })
    }

    fn fetch_artifact<'a>(
        &'a self,
        _endpoint: &'a Endpoint,
        _descriptor: &'a OutputDescriptor,
    ) -> BoxFuture<'a, Artifact, EngineError> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.fetch_calls = state.fetch_calls.saturating_add(1);
            if state.fetch_failures > 0 {
                state.fetch_failures -= 1;
                return Err(EngineError::Transport {
                    message: String::from("connection reset"),
                });
            }
            Ok(state.artifact.clone())
        })
    }
}
