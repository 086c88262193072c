//! REST adapter for GPU marketplaces exposing a JSON instance API.
//!
//! Every call goes through the shared [`Throttle`] and carries the client
//! timeout, so a hung provider can never block a run indefinitely.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    BoxFuture, ComputeProvider, Instance, InstanceAddress, InstanceStatus, Offer,
    ProviderError, ProvisionRequest, Throttle,
};

/// Connection settings for [`HttpProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpProviderConfig {
    /// Base URL of the provider API, without a trailing slash.
    pub base_url: String,
    /// Bearer token used to authenticate every request.
    pub token: String,
    /// Upper bound on each HTTP request.
    pub request_timeout: Duration,
    /// Minimum spacing between request starts.
    pub min_spacing: Duration,
    /// Maximum number of concurrent requests.
    pub max_in_flight: usize,
}

/// Provider adapter speaking the marketplace REST API.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
    throttle: Throttle,
}

#[derive(Deserialize)]
struct OffersEnvelope {
    offers: Vec<Offer>,
}

#[derive(Deserialize)]
struct InstanceEnvelope {
    instance: InstanceWire,
}

#[derive(Deserialize)]
struct InstancesEnvelope {
    #[serde(default)]
    instances: Vec<InstanceWire>,
}

#[derive(Deserialize)]
struct InstanceWire {
    id: String,
    status: String,
    #[serde(default)]
    public_host: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    created_at: Option<u64>,
}

#[derive(Serialize)]
struct CreateInstanceBody<'a> {
    offer_id: &'a str,
    label: &'a str,
    bootstrap: &'a str,
}

impl From<InstanceWire> for Instance {
    fn from(wire: InstanceWire) -> Self {
        let address = match (wire.public_host, wire.port) {
            (Some(host), Some(port)) if !host.trim().is_empty() => {
                Some(InstanceAddress { host, port })
            }
            _ => None,
        };
        let created_at = wire.created_at.map_or_else(SystemTime::now, |secs| {
            UNIX_EPOCH + Duration::from_secs(secs)
        });
        Self {
            id: wire.id,
            status: InstanceStatus::from_wire(&wire.status),
            address,
            label: wire.label,
            created_at,
        }
    }
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("base_url", &self.base_url)
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    /// Builds the adapter and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Connect`] when the HTTP client cannot be
    /// constructed (for example when the TLS backend fails to initialise).
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| ProviderError::Connect {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            token: config.token,
            throttle: Throttle::new(config.min_spacing, config.max_in_flight),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        instance_id: Option<&str>,
    ) -> Result<Vec<u8>, ProviderError> {
        let _permit = self
            .throttle
            .acquire()
            .await
            .map_err(|err| ProviderError::Connect {
                message: err.to_string(),
            })?;

        let response = builder
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.bytes().await.map_err(classify_transport)?;

        if status.is_success() {
            return Ok(body.to_vec());
        }
        if status == StatusCode::NOT_FOUND
            && let Some(id) = instance_id
        {
            return Err(ProviderError::NotFound {
                instance_id: id.to_owned(),
            });
        }
        Err(ProviderError::Api {
            status: status.as_u16(),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        instance_id: Option<&str>,
    ) -> Result<T, ProviderError> {
        let body = self.send(builder, instance_id).await?;
        serde_json::from_slice(&body).map_err(|err| ProviderError::Decode {
            message: err.to_string(),
        })
    }
}

/// Separates failures that provably never reached the provider from those
/// whose outcome is unknown.
fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_builder() {
        ProviderError::Connect {
            message: err.to_string(),
        }
    } else if err.is_decode() {
        ProviderError::Decode {
            message: err.to_string(),
        }
    } else {
        ProviderError::Ambiguous {
            message: err.to_string(),
        }
    }
}

impl ComputeProvider for HttpProvider {
    fn list_offers(&self) -> BoxFuture<'_, Vec<Offer>, ProviderError> {
        Box::pin(async move {
            let envelope: OffersEnvelope = self
                .send_json(self.client.get(self.url("/offers")), None)
                .await?;
            Ok(envelope.offers)
        })
    }

    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> BoxFuture<'a, Instance, ProviderError> {
        Box::pin(async move {
            let body = CreateInstanceBody {
                offer_id: &request.offer_id,
                label: &request.label,
                bootstrap: &request.bootstrap,
            };
            let envelope: InstanceEnvelope = self
                .send_json(self.client.post(self.url("/instances")).json(&body), None)
                .await?;
            Ok(envelope.instance.into())
        })
    }

    fn describe<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, Instance, ProviderError> {
        Box::pin(async move {
            let url = self.url(&format!("/instances/{instance_id}"));
            let envelope: InstanceEnvelope = self
                .send_json(self.client.get(url), Some(instance_id))
                .await?;
            Ok(envelope.instance.into())
        })
    }

    fn list_instances<'a>(
        &'a self,
        label: &'a str,
    ) -> BoxFuture<'a, Vec<Instance>, ProviderError> {
        Box::pin(async move {
            let request = self
                .client
                .get(self.url("/instances"))
                .query(&[("label", label)]);
            let envelope: InstancesEnvelope = self.send_json(request, None).await?;
            Ok(envelope
                .instances
                .into_iter()
                .map(Instance::from)
                .filter(|instance| instance.label.as_deref() == Some(label))
                .collect())
        })
    }

    fn destroy<'a>(&'a self, instance_id: &'a str) -> BoxFuture<'a, (), ProviderError> {
        Box::pin(async move {
            let url = self.url(&format!("/instances/{instance_id}"));
            self.send(self.client.delete(url), Some(instance_id))
                .await
                .map(|_| ())
        })
    }
}
