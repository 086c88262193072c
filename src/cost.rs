//! Cost estimation from offer price and elapsed wall-clock time.

use std::fmt;
use std::time::Duration;

use crate::provider::Offer;

/// Seconds in the unit of time offers are priced in.
pub const SECONDS_PER_PRICE_UNIT: f64 = 3600.0;

/// Estimated cost of renting `offer` for `elapsed`.
///
/// Negative or non-numeric prices are treated as free so the estimate is
/// always non-decreasing in `elapsed`.
#[must_use]
#[expect(
    clippy::float_arithmetic,
    reason = "prices are fractional currency amounts"
)]
pub fn estimate(offer: &Offer, elapsed: Duration) -> f64 {
    offer.price_per_hour.max(0.0) * elapsed.as_secs_f64() / SECONDS_PER_PRICE_UNIT
}

/// Realised cost of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct CostReport {
    /// Offer the instance was rented from.
    pub offer_id: String,
    /// Price per hour of the offer.
    pub price_per_hour: f64,
    /// Billable wall-clock seconds, from provisioning to teardown.
    pub elapsed_seconds: f64,
    /// Derived cost estimate.
    pub estimated_cost: f64,
}

impl CostReport {
    /// Builds a report for `offer` billed over `elapsed`.
    #[must_use]
    pub fn new(offer: &Offer, elapsed: Duration) -> Self {
        Self {
            offer_id: offer.id.clone(),
            price_per_hour: offer.price_per_hour,
            elapsed_seconds: elapsed.as_secs_f64(),
            estimated_cost: estimate(offer, elapsed),
        }
    }
}

impl fmt::Display for CostReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "offer {} at {:.4}/h for {:.1}s: estimated cost {:.4}",
            self.offer_id, self.price_per_hour, self.elapsed_seconds, self.estimated_cost
        )
    }
}
