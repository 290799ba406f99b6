//! Binance reference prices.
//!
//! Uses the public book ticker, so no credentials are needed.
//! Buy price = best ask, sell price = best bid, both against USDT.
//! Stablecoin legs are priced at 1.0 without a request.
//!
//! API docs: https://binance-docs.github.io/apidocs/spot/en/#symbol-order-book-ticker
//! Endpoint: GET /api/v3/ticker/bookTicker?symbol=PEPEUSDT

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::ReferencePriceSource;
use crate::types::{Leg, ReferencePriceSnapshot, Token};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const QUOTE_ASSET: &str = "USDT";

const STABLECOINS: &[&str] = &["USDT", "USDC", "BUSD", "DAI", "FDUSD", "TUSD"];

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BookTicker {
    symbol: String,
    bid_price: String,
    ask_price: String,
}

impl BookTicker {
    /// `(buy, sell)` = `(ask, bid)`.
    fn prices(&self) -> Result<(f64, f64)> {
        let ask: f64 = self
            .ask_price
            .parse()
            .with_context(|| format!("Bad askPrice for {}: {}", self.symbol, self.ask_price))?;
        let bid: f64 = self
            .bid_price
            .parse()
            .with_context(|| format!("Bad bidPrice for {}: {}", self.symbol, self.bid_price))?;
        Ok((ask, bid))
    }
}

fn is_stable(symbol: &str) -> bool {
    STABLECOINS.iter().any(|s| s.eq_ignore_ascii_case(symbol))
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct BinanceReferenceSource {
    http: Client,
    base_url: String,
}

impl BinanceReferenceSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("ROUTESCAN/0.1.0")
            .build()
            .context("Failed to build HTTP client for Binance")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// `(buy, sell)` in USD for one leg.
    async fn leg_prices(&self, leg: &Leg) -> Result<(f64, f64)> {
        if is_stable(&leg.symbol) {
            return Ok((1.0, 1.0));
        }

        let symbol = format!("{}{QUOTE_ASSET}", leg.symbol.to_uppercase());
        let url = format!(
            "{}/api/v3/ticker/bookTicker?symbol={}",
            self.base_url,
            urlencoding::encode(&symbol)
        );
        debug!(url = %url, "Fetching Binance book ticker");

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("Binance API request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance API error {status}: {body}");
        }

        let ticker: BookTicker = resp
            .json()
            .await
            .context("Failed to parse Binance bookTicker response")?;

        ticker.prices()
    }
}

#[async_trait]
impl ReferencePriceSource for BinanceReferenceSource {
    async fn fetch_reference_price(&self, token: &Token) -> Result<ReferencePriceSnapshot> {
        let (left, right) = tokio::try_join!(self.leg_prices(&token.left), self.leg_prices(&token.right))?;
        Ok(ReferencePriceSnapshot {
            left_buy: left.0,
            left_sell: left.1,
            right_buy: right.0,
            right_sell: right.1,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
