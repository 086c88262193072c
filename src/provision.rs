//! Instance creation with reconciliation of ambiguous create calls.
//!
//! Billing starts the moment the provider applies a create request. When
//! the response is lost the request may still have been applied, so the
//! provisioner looks the run label up before reporting failure. An
//! instance that exists but was never adopted would otherwise leak.
//!
//! The lookup is retried while it fails, because the fault that lost the
//! create response tends to hit the next request too. Only a lookup that
//! answers and finds nothing proves the create was never applied.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::{BootstrapContext, BootstrapError, BootstrapTemplate};
use crate::polling::{PollError, PollPolicy, Probe, poll_until};
use crate::provider::{ComputeProvider, Instance, Offer, ProviderError, ProvisionRequest};

/// Interface the in-instance engine binds to.
pub const LISTEN_HOST: &str = "0.0.0.0";

/// Retry budget for label lookups after an ambiguous create.
pub const RECONCILE_POLICY: PollPolicy =
    PollPolicy::new(Duration::from_secs(2), Duration::from_secs(30));

/// Errors raised while creating an instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProvisionError {
    /// The bootstrap script could not be rendered; nothing was created.
    #[error("bootstrap rendering failed: {0}")]
    Bootstrap(#[from] BootstrapError),
    /// The provider refused the request.
    #[error("provider rejected instance creation: {0}")]
    Rejected(#[source] ProviderError),
    /// The create outcome was unknown and no instance carries the label.
    #[error("instance creation for `{label}` could not be confirmed: {cause}")]
    Unreconciled {
        /// Run label the lookup searched for.
        label: String,
        /// Error that made the create ambiguous.
        cause: ProviderError,
    },
    /// The create outcome was unknown and every label lookup failed. An
    /// instance carrying the label may still exist and bill.
    #[error(
        "instance creation for `{label}` is unknown and {attempts} label lookups failed; \
         check the provider for instances labelled `{label}`: {cause}"
    )]
    LookupFailed {
        /// Run label to search for by hand.
        label: String,
        /// Number of lookups issued.
        attempts: u32,
        /// Error that made the create ambiguous.
        cause: ProviderError,
    },
}

/// Creates instances for selected offers.
#[derive(Debug)]
pub struct InstanceProvisioner<'a, P: ?Sized> {
    provider: &'a P,
    template: &'a BootstrapTemplate,
    engine_port: u16,
    reconcile: PollPolicy,
}

impl<'a, P> InstanceProvisioner<'a, P>
where
    P: ComputeProvider + ?Sized,
{
    /// Creates a provisioner rendering `template` for an engine on
    /// `engine_port`.
    #[must_use]
    pub const fn new(provider: &'a P, template: &'a BootstrapTemplate, engine_port: u16) -> Self {
        Self {
            provider,
            template,
            engine_port,
            reconcile: RECONCILE_POLICY,
        }
    }

    /// Overrides the label lookup budget used after an ambiguous create.
    #[must_use]
    pub const fn with_reconcile_policy(mut self, policy: PollPolicy) -> Self {
        self.reconcile = policy;
        self
    }

    /// Requests an instance for `offer` tagged with `label`.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError`] when the bootstrap cannot be rendered, the
    /// provider rejects the request, or an ambiguous create cannot be
    /// reconciled.
    pub async fn provision(&self, offer: &Offer, label: &str) -> Result<Instance, ProvisionError> {
        let bootstrap = self.template.render(&BootstrapContext {
            listen_host: LISTEN_HOST.to_owned(),
            listen_port: self.engine_port,
            offer_id: offer.id.clone(),
            run_label: label.to_owned(),
        })?;
        let request = ProvisionRequest {
            offer_id: offer.id.clone(),
            label: label.to_owned(),
            bootstrap,
        };

        match self.provider.provision(&request).await {
            Ok(instance) => {
                info!(instance_id = %instance.id, offer_id = %offer.id, "instance requested");
                Ok(instance)
            }
            Err(err @ ProviderError::Ambiguous { .. }) => self.reconcile(label, err).await,
            Err(err) => Err(ProvisionError::Rejected(err)),
        }
    }

    async fn reconcile(&self, label: &str, cause: ProviderError) -> Result<Instance, ProvisionError> {
        warn!(%label, error = %cause, "create outcome unknown; looking up run label");
        // Not tied to the run's token: abandoning the lookup could orphan
        // an instance that is already billing.
        let uncancellable = CancellationToken::new();
        let adopted = poll_until(self.reconcile, &uncancellable, |attempt| async move {
            match self.provider.list_instances(label).await {
                Ok(instances) => adopt(label, instances).map_or(Probe::Abort(()), Probe::Ready),
                Err(lookup) => {
                    warn!(%label, attempt, error = %lookup, "label lookup failed");
                    Probe::Pending
                }
            }
        })
        .await;

        match adopted {
            Ok(instance) => {
                info!(instance_id = %instance.id, %label, "adopted instance after ambiguous create");
                Ok(instance)
            }
            Err(PollError::Aborted(())) => Err(ProvisionError::Unreconciled {
                label: label.to_owned(),
                cause,
            }),
            Err(PollError::TimedOut { attempts, .. }) => Err(ProvisionError::LookupFailed {
                label: label.to_owned(),
                attempts,
                cause,
            }),
            Err(PollError::Cancelled(_)) => Err(ProvisionError::LookupFailed {
                label: label.to_owned(),
                attempts: 0,
                cause,
            }),
        }
    }
}

fn adopt(label: &str, instances: Vec<Instance>) -> Option<Instance> {
    let mut matching = instances
        .into_iter()
        .filter(|instance| instance.label.as_deref() == Some(label));
    let first = matching.next()?;
    if matching.next().is_some() {
        warn!(%label, "several instances carry the run label; adopting the first");
    }
    Some(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ProvisionScript, ScriptedProvider, offer};

    async fn provision_with(
        script: ProvisionScript,
    ) -> (ScriptedProvider, Result<Instance, ProvisionError>) {
        let provider = ScriptedProvider::with_offers(Vec::new()).provisioning(script);
        let template = BootstrapTemplate::default();
        let result = InstanceProvisioner::new(&provider, &template, 8188)
            .provision(&offer("o-1", 0.4, 24), "spotrun-test")
            .await;
        (provider, result)
    }

    #[tokio::test]
    async fn successful_create_returns_labelled_instance() {
        let (provider, result) = provision_with(ProvisionScript::Accept).await;

        let instance = result.expect("instance created");
        assert_eq!(instance.label.as_deref(), Some("spotrun-test"));
        assert_eq!(provider.provision_calls(), 1);
    }

    #[tokio::test]
    async fn lost_response_adopts_existing_instance() {
        let (provider, result) = provision_with(ProvisionScript::AcceptThenLoseResponse).await;

        let instance = result.expect("instance adopted");
        assert_eq!(provider.live_instances(), vec![instance.id]);
    }

    #[tokio::test]
    async fn lost_request_fails_without_instance() {
        let (provider, result) = provision_with(ProvisionScript::LoseRequest).await;

        assert!(
            matches!(result, Err(ProvisionError::Unreconciled { ref label, .. }) if label == "spotrun-test"),
            "{result:?}"
        );
        assert!(provider.live_instances().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_is_retried_before_adopting() {
        let provider = ScriptedProvider::default()
            .provisioning(ProvisionScript::AcceptThenLoseResponse)
            .failing_lookups(1);
        let template = BootstrapTemplate::default();

        let instance = InstanceProvisioner::new(&provider, &template, 8188)
            .provision(&offer("o-1", 0.4, 24), "spotrun-test")
            .await
            .expect("instance adopted on the second lookup");

        assert_eq!(provider.lookup_calls(), 2);
        assert_eq!(provider.live_instances(), vec![instance.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_lookup_failure_names_the_label() {
        let provider = ScriptedProvider::default()
            .provisioning(ProvisionScript::AcceptThenLoseResponse)
            .failing_lookups(u32::MAX);
        let template = BootstrapTemplate::default();
        let policy = PollPolicy::new(Duration::from_secs(1), Duration::from_secs(5));
        let started = tokio::time::Instant::now();

        let result = InstanceProvisioner::new(&provider, &template, 8188)
            .with_reconcile_policy(policy)
            .provision(&offer("o-1", 0.4, 24), "spotrun-test")
            .await;

        let err = result.expect_err("lookups keep failing");
        assert!(matches!(err, ProvisionError::LookupFailed { .. }), "{err:?}");
        assert!(err.to_string().contains("spotrun-test"), "{err}");
        assert!(provider.lookup_calls() > 1);
        assert!(started.elapsed() <= policy.timeout + policy.interval);
    }

    #[tokio::test]
    async fn rejection_is_not_reconciled() {
        let (_, result) = provision_with(ProvisionScript::Reject).await;

        assert!(
            matches!(result, Err(ProvisionError::Rejected(ProviderError::Api { status: 409, .. }))),
            "{result:?}"
        );
    }

    #[tokio::test]
    async fn bad_template_creates_nothing() {
        let provider = ScriptedProvider::default();
        let template = BootstrapTemplate::new("start {{engine}}").expect("template");

        let result = InstanceProvisioner::new(&provider, &template, 8188)
            .provision(&offer("o-1", 0.4, 24), "spotrun-test")
            .await;

        assert!(matches!(result, Err(ProvisionError::Bootstrap(_))), "{result:?}");
        assert_eq!(provider.provision_calls(), 0);
    }
}
