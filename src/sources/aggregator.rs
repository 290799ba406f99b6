//! 1inch-style HTTP quote aggregators.
//!
//! Request:  GET {base}/quote?src={token_in}&dst={token_out}&amount={raw}
//! Response: { "dstAmount": "<raw integer string>", ... }
//!
//! `{chain}` in the base URL is replaced with the numeric EVM chain id, e.g.
//! `https://api.1inch.dev/swap/v6.0/{chain}`. Non-EVM chains are rejected.
//! Auth: optional `Authorization: Bearer {key}`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::QuoteSource;
use crate::types::{Quote, QuoteRequest};

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteResponse {
    dst_amount: String,
    #[serde(default)]
    price_impact: Option<f64>,
}

impl QuoteResponse {
    fn into_quote(self, out_decimals: u8) -> Result<Quote> {
        let raw: u128 = self
            .dst_amount
            .parse()
            .with_context(|| format!("Bad dstAmount: {}", self.dst_amount))?;
        Ok(Quote {
            amount_out: from_raw(raw, out_decimals),
            price_impact_bps: self
                .price_impact
                .filter(|p| p.is_finite() && *p >= 0.0)
                .map(|p| (p * 100.0).round() as u32),
        })
    }
}

/// Base units → human units.
fn from_raw(raw: u128, decimals: u8) -> f64 {
    raw as f64 / 10f64.powi(decimals as i32)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct HttpQuoteSource {
    name: String,
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpQuoteSource {
    pub fn new(name: &str, base_url: &str, api_key: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .user_agent("ROUTESCAN/0.1.0")
            .build()
            .with_context(|| format!("Failed to build HTTP client for {name}"))?;

        Ok(Self {
            name: name.to_lowercase(),
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(SecretString::new),
        })
    }

    fn quote_url(&self, request: &QuoteRequest) -> Result<String> {
        let chain_id = request
            .chain
            .evm_id()
            .with_context(|| format!("{} does not serve chain {}", self.name, request.chain))?;
        let base = self.base_url.replace("{chain}", &chain_id.to_string());
        Ok(format!(
            "{base}/quote?src={}&dst={}&amount={}",
            urlencoding::encode(&request.token_in.contract),
            urlencoding::encode(&request.token_out.contract),
            request.amount_in_raw,
        ))
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote> {
        let url = self.quote_url(request)?;
        debug!(provider = %self.name, key = %request.key, "Requesting quote");

        let mut req = self.http.get(&url).header("Accept", "application/json");
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("{} quote request failed", self.name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("{} API error {status}: {body}", self.name);
        }

        let body: QuoteResponse = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} quote response", self.name))?;

        body.into_quote(request.token_out.decimals)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
