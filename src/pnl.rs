//! Route economics.
//!
//! Attaches a profit/loss estimate to every successful quote. Decimal
//! arithmetic keeps tiny-price tokens (e.g. 1e-6 USD) from losing precision
//! when multiplied back up to USD amounts.

use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Quote, ReferencePriceSnapshot, Route};

/// Estimated economics of one route at quote time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEconomics {
    /// USD spent buying the entry leg on the reference venue.
    pub cost_usd: Decimal,
    /// USD received selling the provider's output on the reference venue.
    pub proceeds_usd: Decimal,
    pub pnl_usd: Decimal,
    /// P/L relative to cost, in basis points.
    pub pnl_bps: i64,
}

/// Convert an f64 to Decimal, falling back to zero for non-finite input.
pub fn d(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Estimate P/L for a route given its reference snapshot and quote.
///
/// Forward: buy left on the venue, swap to right, sell right on the venue.
/// Reverse: buy right on the venue, swap to left, sell left on the venue.
pub fn estimate(route: &Route, snapshot: &ReferencePriceSnapshot, quote: &Quote) -> RouteEconomics {
    let cost = d(route.amount);
    let exit_price = match route.direction {
        Direction::Forward => snapshot.right_sell,
        Direction::Reverse => snapshot.left_sell,
    };
    let proceeds = d(quote.amount_out) * d(exit_price);
    let pnl = proceeds - cost;

    let pnl_bps = if cost > Decimal::ZERO {
        (pnl / cost * dec!(10000)).round().to_i64().unwrap_or(0)
    } else {
        0
    };

    RouteEconomics {
        cost_usd: cost.round_dp(6),
        proceeds_usd: proceeds.round_dp(6),
        pnl_usd: pnl.round_dp(6),
        pnl_bps,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
