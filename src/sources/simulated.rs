//! Deterministic offline sources.
//!
//! Used for dry runs and local development: prices are derived from the
//! leg symbol, so the same token always prices the same way, and each
//! provider applies a small fixed edge derived from its id.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{QuoteSource, ReferencePriceSource};
use crate::types::{Quote, QuoteRequest, ReferencePriceSnapshot, Token};

const STABLECOINS: &[&str] = &["USDT", "USDC", "BUSD", "DAI", "FDUSD", "TUSD"];

/// Half-spread applied around the mid price on the reference venue (10 bps).
const HALF_SPREAD: f64 = 0.0005;

/// Stable FNV-1a hash so prices don't depend on the std hasher seed.
fn fnv1a(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Shared mid-price table for simulated sources.
#[derive(Debug, Default)]
pub struct SimulatedMarket {
    overrides: RwLock<HashMap<String, f64>>,
}

impl SimulatedMarket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the USD mid price of `symbol`.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.overrides.write().insert(symbol.to_uppercase(), price);
    }

    /// USD mid price: pinned value, 1.0 for stablecoins, otherwise derived
    /// from the symbol (between 1e-6 and ~100).
    pub fn mid_price(&self, symbol: &str) -> f64 {
        let symbol = symbol.to_uppercase();
        if let Some(p) = self.overrides.read().get(&symbol) {
            return *p;
        }
        if STABLECOINS.contains(&symbol.as_str()) {
            return 1.0;
        }
        let h = fnv1a(&symbol);
        let mantissa = 1.0 + (h % 9_000) as f64 / 1_000.0;
        let exponent = ((h >> 16) % 8) as i32 - 6;
        mantissa * 10f64.powi(exponent)
    }
}

// ---------------------------------------------------------------------------
// Reference
// ---------------------------------------------------------------------------

pub struct SimulatedReferenceSource {
    market: Arc<SimulatedMarket>,
}

impl SimulatedReferenceSource {
    pub fn new(market: Arc<SimulatedMarket>) -> Self {
        Self { market }
    }
}

#[async_trait]
impl ReferencePriceSource for SimulatedReferenceSource {
    async fn fetch_reference_price(&self, token: &Token) -> Result<ReferencePriceSnapshot> {
        let left = self.market.mid_price(&token.left.symbol);
        let right = self.market.mid_price(&token.right.symbol);
        Ok(ReferencePriceSnapshot {
            left_buy: left * (1.0 + HALF_SPREAD),
            left_sell: left * (1.0 - HALF_SPREAD),
            right_buy: right * (1.0 + HALF_SPREAD),
            right_sell: right * (1.0 - HALF_SPREAD),
        })
    }
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

pub struct SimulatedQuoteSource {
    name: String,
    market: Arc<SimulatedMarket>,
    latency: Duration,
    failing: bool,
    /// Output multiplier in `[0.99, 1.01)`.
    edge: f64,
}

impl SimulatedQuoteSource {
    pub fn new(name: &str, market: Arc<SimulatedMarket>, latency: Duration) -> Self {
        let edge = 0.99 + (fnv1a(&name.to_lowercase()) % 200) as f64 / 10_000.0;
        Self {
            name: name.to_lowercase(),
            market,
            latency,
            failing: false,
            edge,
        }
    }

    /// Make every quote fail after the simulated latency.
    pub fn failing(mut self, failing: bool) -> Self {
        self.failing = failing;
        self
    }
}

#[async_trait]
impl QuoteSource for SimulatedQuoteSource {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        tokio::time::sleep(self.latency).await;
        if self.failing {
            anyhow::bail!("{} simulated upstream error (HTTP 503)", self.name);
        }

        let price_in = self.market.mid_price(&request.token_in.symbol);
        let price_out = self.market.mid_price(&request.token_out.symbol);
        let amount_out = request.amount_in * price_in / price_out * self.edge;
        debug!(provider = %self.name, key = %request.key, amount_out, "Simulated quote");

        Ok(Quote {
            amount_out,
            price_impact_bps: Some(((1.0 - self.edge).abs() * 10_000.0) as u32),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
