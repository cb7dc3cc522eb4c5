use crate::market::{MarketError, Marketplace, PriceOutcome};
use crate::pricing::ceil_to_100;
use thiserror::Error;
use tracing::{debug, warn};

/// Retreat factor applied to the marketplace's last on-file price when a
/// proposal is rejected. The constant has no documented business rationale;
/// it is preserved as-is and kept configurable pending product-owner
/// confirmation.
pub const DEFAULT_RETREAT_FACTOR: f64 = 0.2;

pub const DEFAULT_MAX_ROUNDS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct NegotiationSettings {
    pub max_rounds: u32,
    pub retreat_factor: f64,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            retreat_factor: DEFAULT_RETREAT_FACTOR,
        }
    }
}

impl NegotiationSettings {
    pub fn from_env() -> Self {
        let max_rounds = std::env::var("PRICE_MAX_ROUNDS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value >= 1)
            .unwrap_or(DEFAULT_MAX_ROUNDS);
        let retreat_factor = std::env::var("PRICE_RETREAT_FACTOR")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0 && *value <= 1.0)
            .unwrap_or(DEFAULT_RETREAT_FACTOR);
        Self {
            max_rounds,
            retreat_factor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedPrice {
    pub price: u32,
    pub rounds: u32,
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("marketplace kept rejecting for {rounds} rounds, last attempted {last_attempted}")]
    DidNotConverge { rounds: u32, last_attempted: u32 },
    #[error(transparent)]
    Market(#[from] MarketError),
}

/// Retreat toward `retreat_factor` of the price still on file, but never
/// below the originally desired target; the endpoint only accepts 100-won
/// increments.
fn next_proposal(on_file: u32, target: u32, retreat_factor: f64) -> u32 {
    ceil_to_100((f64::from(on_file) * retreat_factor).max(f64::from(target)))
}

/// Drives the marketplace price endpoint until it accepts a proposal or the
/// round budget runs out. No local state is touched here; persisting the
/// accepted price is the pipeline's job.
///
/// A round that times out is counted against the budget and the proposal is
/// re-sent; any other marketplace failure aborts immediately.
pub async fn negotiate(
    market: &dyn Marketplace,
    external_id: &str,
    target: u32,
    settings: &NegotiationSettings,
) -> Result<NegotiatedPrice, NegotiationError> {
    let mut proposal = target;

    for round in 1..=settings.max_rounds {
        match market.propose_price(external_id, proposal).await {
            Ok(PriceOutcome::Accepted(applied)) if applied == proposal => {
                debug!(
                    target = "sync.negotiation",
                    external_id, price = applied, round, "price accepted"
                );
                return Ok(NegotiatedPrice {
                    price: applied,
                    rounds: round,
                });
            }
            Ok(PriceOutcome::Accepted(applied)) => {
                // applied off-proposal: treat like any other on-file price
                debug!(
                    target = "sync.negotiation",
                    external_id, proposed = proposal, applied, round, "price applied off-proposal"
                );
                proposal = next_proposal(applied, target, settings.retreat_factor);
            }
            Ok(PriceOutcome::Rejected { previous }) => {
                debug!(
                    target = "sync.negotiation",
                    external_id, proposed = proposal, previous, round, "price rejected"
                );
                proposal = next_proposal(previous, target, settings.retreat_factor);
            }
            Err(MarketError::Timeout) => {
                warn!(
                    target = "sync.negotiation",
                    external_id, proposed = proposal, round, "round timed out"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(NegotiationError::DidNotConverge {
        rounds: settings.max_rounds,
        last_attempted: proposal,
    })
}
