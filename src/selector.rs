//! Cost-constrained offer selection.
//!
//! Selection never retries: a constraint set that matches nothing keeps
//! matching nothing until the catalog changes, so the caller decides
//! whether to broaden the constraints or try again later.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::cost;
use crate::provider::{ComputeProvider, Offer, ProviderError};

/// Upper bound on the projected cost of a whole run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CostCap {
    /// Maximum acceptable cost.
    pub max_cost: f64,
    /// Worst-case billable duration used for the projection.
    pub budget: Duration,
}

/// Requirements an offer must satisfy.
#[derive(Clone, Debug, PartialEq)]
pub struct Constraints {
    /// Minimum GPU memory in gigabytes.
    pub min_gpu_memory_gb: u32,
    /// Required compute class, if any (case-insensitive).
    pub compute_class: Option<String>,
    /// Maximum price per hour.
    pub price_ceiling: f64,
    /// Minimum reliability score.
    pub min_reliability: f64,
    /// Optional cap on the projected cost of the run.
    pub cost_cap: Option<CostCap>,
}

impl Constraints {
    /// Creates constraints on capability and price only.
    #[must_use]
    pub const fn new(min_gpu_memory_gb: u32, price_ceiling: f64) -> Self {
        Self {
            min_gpu_memory_gb,
            compute_class: None,
            price_ceiling,
            min_reliability: 0.0,
            cost_cap: None,
        }
    }

    /// Returns `true` when `offer` satisfies every constraint.
    #[must_use]
    pub fn admits(&self, offer: &Offer) -> bool {
        let class_matches = self
            .compute_class
            .as_deref()
            .is_none_or(|class| offer.compute_class.eq_ignore_ascii_case(class));
        let within_cap = self
            .cost_cap
            .is_none_or(|cap| cost::estimate(offer, cap.budget) <= cap.max_cost);

        offer.gpu_memory_gb >= self.min_gpu_memory_gb
            && offer.price_per_hour <= self.price_ceiling
            && offer.reliability >= self.min_reliability
            && class_matches
            && within_cap
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gpu_memory >= {} GB, price <= {}/h, reliability >= {}",
            self.min_gpu_memory_gb, self.price_ceiling, self.min_reliability
        )?;
        if let Some(class) = &self.compute_class {
            write!(f, ", class = {class}")?;
        }
        if let Some(cap) = &self.cost_cap {
            write!(
                f,
                ", run cost <= {} over {}s",
                cap.max_cost,
                cap.budget.as_secs()
            )?;
        }
        Ok(())
    }
}

/// Errors raised by offer selection. Neither variant incurs cost.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SelectError {
    /// No offer satisfies the constraints.
    #[error("no offer satisfies {constraints}")]
    Unavailable {
        /// Rendered constraints for diagnostics.
        constraints: String,
        /// Number of offers in the catalog.
        considered: usize,
    },
    /// The catalog could not be fetched.
    #[error("offer catalog query failed: {0}")]
    Catalog(#[source] ProviderError),
}

/// Returns every admitted offer, cheapest first, ties broken by id.
#[must_use]
pub fn rank(offers: &[Offer], constraints: &Constraints) -> Vec<Offer> {
    let mut admitted: Vec<Offer> = offers
        .iter()
        .filter(|offer| constraints.admits(offer))
        .cloned()
        .collect();
    admitted.sort_by(compare_offers);
    admitted
}

/// Returns the cheapest offer in `offers` satisfying `constraints`.
///
/// # Errors
///
/// Returns [`SelectError::Unavailable`] when nothing matches.
pub fn select(offers: &[Offer], constraints: &Constraints) -> Result<Offer, SelectError> {
    rank(offers, constraints).into_iter().next().ok_or_else(|| {
        debug!(considered = offers.len(), %constraints, "no offer matched");
        SelectError::Unavailable {
            constraints: constraints.to_string(),
            considered: offers.len(),
        }
    })
}

fn compare_offers(left: &Offer, right: &Offer) -> Ordering {
    left.price_per_hour
        .total_cmp(&right.price_per_hour)
        .then_with(|| left.id.cmp(&right.id))
}

/// Picks offers from a provider's catalog.
#[derive(Debug)]
pub struct ResourceSelector<'a, P: ?Sized> {
    provider: &'a P,
}

impl<'a, P> ResourceSelector<'a, P>
where
    P: ComputeProvider + ?Sized,
{
    /// Creates a selector over `provider`'s catalog.
    #[must_use]
    pub const fn new(provider: &'a P) -> Self {
        Self { provider }
    }

    /// Returns the cheapest offer satisfying `constraints`.
    ///
    /// # Errors
    ///
    /// Returns [`SelectError::Unavailable`] when nothing matches and
    /// [`SelectError::Catalog`] when the catalog query fails.
    pub async fn select(&self, constraints: &Constraints) -> Result<Offer, SelectError> {
        let offers = self
            .provider
            .list_offers()
            .await
            .map_err(SelectError::Catalog)?;
        let offer = select(&offers, constraints)?;
        info!(
            offer_id = %offer.id,
            price_per_hour = offer.price_per_hour,
            gpu_memory_gb = offer.gpu_memory_gb,
            considered = offers.len(),
            "selected offer"
        );
        Ok(offer)
    }
}
