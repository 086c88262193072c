//! Compute provider abstraction for renting short-lived GPU instances.
//!
//! The pipeline talks to a provider only through [`ComputeProvider`]; each
//! concrete marketplace becomes a thin adapter such as [`HttpProvider`].

mod http;
mod throttle;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpProvider, HttpProviderConfig};
pub use throttle::{Throttle, ThrottlePermit};

/// Future returned by provider and engine operations.
pub type BoxFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Priced rental proposal returned by the offer catalog.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Offer {
    /// Provider assigned identifier.
    pub id: String,
    /// Price in currency units per hour of wall-clock time.
    pub price_per_hour: f64,
    /// GPU memory available to the instance, in gigabytes.
    pub gpu_memory_gb: u32,
    /// Provider compute class (for example `rtx4090`).
    #[serde(default)]
    pub compute_class: String,
    /// Host reliability score in the range `0.0..=1.0`.
    #[serde(default)]
    pub reliability: f64,
}

/// Lifecycle state of a rented instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    /// Creation was requested but the provider has not scheduled it yet.
    Requesting,
    /// The provider is booting the instance.
    Provisioning,
    /// Infrastructure reports the instance as running.
    Running,
    /// The in-instance engine answered its health probe.
    Ready,
    /// The provider gave up on the instance.
    Failed,
    /// The instance is stopped or destroyed.
    Stopped,
}

impl InstanceStatus {
    /// Maps a provider status string onto the lifecycle.
    ///
    /// Unknown values are treated as still provisioning so the readiness
    /// watcher keeps polling until its own deadline.
    #[must_use]
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "requesting" | "pending" | "created" => Self::Requesting,
            "running" => Self::Running,
            "ready" => Self::Ready,
            "failed" | "error" => Self::Failed,
            "stopped" | "exited" | "destroyed" | "terminated" => Self::Stopped,
            _ => Self::Provisioning,
        }
    }

    /// Returns `true` once the infrastructure layer is up.
    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running | Self::Ready)
    }

    /// Returns `true` when the instance can no longer become ready.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Requesting => "requesting",
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// Network location of an instance once the provider has exposed it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceAddress {
    /// Hostname or IP address reachable from the orchestrator.
    pub host: String,
    /// TCP port the in-instance engine listens on.
    pub port: u16,
}

impl InstanceAddress {
    /// Returns the HTTP base URL for the address.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Snapshot of a rented instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider assigned identifier.
    pub id: String,
    /// Last status reported by the provider.
    pub status: InstanceStatus,
    /// Reachable address, populated once the instance is running.
    pub address: Option<InstanceAddress>,
    /// Label attached at creation, used to reconcile ambiguous creates.
    pub label: Option<String>,
    /// Creation time reported by the provider.
    pub created_at: SystemTime,
}

/// Parameters for creating an instance from an offer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProvisionRequest {
    /// Offer to rent.
    pub offer_id: String,
    /// Unique label identifying the run that owns the instance.
    pub label: String,
    /// Rendered bootstrap script executed on first boot.
    pub bootstrap: String,
}

/// Errors raised by provider adapters.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// The request never reached the provider.
    #[error("provider unreachable: {message}")]
    Connect {
        /// Transport error description.
        message: String,
    },
    /// The request may or may not have been applied by the provider.
    #[error("provider request outcome unknown: {message}")]
    Ambiguous {
        /// Transport error description.
        message: String,
    },
    /// The provider answered with a non-success status.
    #[error("provider rejected request ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body returned by the provider.
        body: String,
    },
    /// The instance does not exist (or no longer exists).
    #[error("instance {instance_id} not found")]
    NotFound {
        /// Identifier that was looked up.
        instance_id: String,
    },
    /// The provider answered with a body that could not be decoded.
    #[error("failed to decode provider response: {message}")]
    Decode {
        /// Parser error description.
        message: String,
    },
}

/// Capability interface implemented by compute marketplaces.
pub trait ComputeProvider: Send + Sync {
    /// Returns the full offer catalog.
    fn list_offers(&self) -> BoxFuture<'_, Vec<Offer>, ProviderError>;

    /// Requests creation of an instance. Billing starts with this call.
    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> BoxFuture<'a, Instance, ProviderError>;

    /// Returns the current state of an instance.
    fn describe<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Instance, ProviderError>;

    /// Lists instances carrying the given label.
    fn list_instances<'a>(&'a self, label: &'a str)
    -> BoxFuture<'a, Vec<Instance>, ProviderError>;

    /// Destroys an instance and stops billing for it.
    fn destroy<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, (), ProviderError>;
}

#[cfg(test)]
mod tests;
