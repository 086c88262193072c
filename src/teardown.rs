//! Exactly-once instance destruction.
//!
//! A [`TeardownGuard`] is armed as soon as an instance exists. The first
//! call to [`TeardownGuard::release`] issues the destroy request; later
//! calls are no-ops. If the guard is dropped unreleased, for instance
//! because the run future was dropped mid-flight, it spawns a best-effort
//! release on the current Tokio runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::provider::{ComputeProvider, ProviderError};

/// Raised when the provider fails to destroy an instance.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("failed to destroy instance {instance_id}: {source}")]
pub struct TeardownError {
    /// Instance that may still be billing.
    pub instance_id: String,
    /// Provider failure.
    #[source]
    pub source: ProviderError,
}

/// Guard owning the obligation to destroy one instance.
#[derive(Debug)]
pub struct TeardownGuard<P: ComputeProvider + ?Sized + 'static> {
    provider: Arc<P>,
    instance_id: String,
    released: AtomicBool,
}

impl<P: ComputeProvider + ?Sized + 'static> TeardownGuard<P> {
    /// Arms a guard for `instance_id`.
    #[must_use]
    pub fn arm(provider: Arc<P>, instance_id: impl Into<String>) -> Self {
        let id = instance_id.into();
        info!(instance_id = %id, "teardown guard armed");
        Self {
            provider,
            instance_id: id,
            released: AtomicBool::new(false),
        }
    }

    /// Instance guarded by this guard.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Returns `true` once a release has been attempted.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Destroys the instance on the first call; later calls return
    /// `Ok(())` without contacting the provider.
    ///
    /// # Errors
    ///
    /// Returns [`TeardownError`] when the provider fails to destroy the
    /// instance. The failure is also logged at error level.
    pub async fn release(&self) -> Result<(), TeardownError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        destroy(&*self.provider, &self.instance_id).await
    }
}

impl<P: ComputeProvider + ?Sized + 'static> Drop for TeardownGuard<P> {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let instance_id = std::mem::take(&mut self.instance_id);
        let Ok(runtime) = Handle::try_current() else {
            error!(%instance_id, "guard dropped outside a runtime; instance may still be billing");
            return;
        };
        warn!(%instance_id, "guard dropped unreleased; destroying in background");
        let provider = Arc::clone(&self.provider);
        runtime.spawn(async move {
            destroy(&*provider, &instance_id).await.ok();
        });
    }
}

async fn destroy<P>(provider: &P, instance_id: &str) -> Result<(), TeardownError>
where
    P: ComputeProvider + ?Sized,
{
    match provider.destroy(instance_id).await {
        Ok(()) => {
            info!(instance_id, "instance destroyed");
            Ok(())
        }
        Err(ProviderError::NotFound { .. }) => {
            info!(instance_id, "instance already gone");
            Ok(())
        }
        Err(source) => {
            error!(instance_id, error = %source, "failed to destroy instance");
            Err(TeardownError {
                instance_id: instance_id.to_owned(),
                source,
            })
        }
    }
}
