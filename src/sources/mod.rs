//! Price source integrations.
//!
//! Defines the `ReferencePriceSource` and `QuoteSource` traits the engine
//! calls, a registry mapping provider ids to sources, and implementations for:
//! - Binance: public book ticker as the reference (centralised) price
//! - 1inch-style HTTP aggregators: execution quotes
//! - Simulated: deterministic offline sources for dry runs

pub mod aggregator;
pub mod binance;
pub mod simulated;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{AppConfig, SourceMode};
use crate::types::{Quote, QuoteRequest, ReferencePriceSnapshot, Token};

/// Reference (centralised venue) prices for a token's two legs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferencePriceSource: Send + Sync {
    async fn fetch_reference_price(&self, token: &Token) -> Result<ReferencePriceSnapshot>;
}

/// An execution-quote provider. Fallback providers are ordinary quote sources.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote>;
}

/// The sources a scan can use, keyed by lower-cased provider id.
#[derive(Clone)]
pub struct Sources {
    reference: Arc<dyn ReferencePriceSource>,
    quotes: HashMap<String, Arc<dyn QuoteSource>>,
}

impl Sources {
    pub fn new(reference: Arc<dyn ReferencePriceSource>) -> Self {
        Self {
            reference,
            quotes: HashMap::new(),
        }
    }

    /// Register a quote source. Re-registering a provider replaces it.
    pub fn with_quote(mut self, provider: &str, source: Arc<dyn QuoteSource>) -> Self {
        self.quotes.insert(provider.to_lowercase(), source);
        self
    }

    pub fn reference(&self) -> Arc<dyn ReferencePriceSource> {
        Arc::clone(&self.reference)
    }

    pub fn quote(&self, provider: &str) -> Option<Arc<dyn QuoteSource>> {
        self.quotes.get(&provider.to_lowercase()).cloned()
    }

    pub fn has_quote(&self, provider: &str) -> bool {
        self.quotes.contains_key(&provider.to_lowercase())
    }

    /// Registered provider ids, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.quotes.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Build the sources described by `config.sources`.
pub fn build(config: &AppConfig) -> Result<Sources> {
    match config.sources.mode {
        SourceMode::Simulated => {
            let market = Arc::new(simulated::SimulatedMarket::new());
            let latency = std::time::Duration::from_millis(config.sources.simulated_latency_ms);
            let mut sources =
                Sources::new(Arc::new(simulated::SimulatedReferenceSource::new(market.clone())));

            for provider in configured_providers(config) {
                let failing = config
                    .sources
                    .simulated_failing
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(&provider));
                let source = simulated::SimulatedQuoteSource::new(&provider, market.clone(), latency)
                    .failing(failing);
                sources = sources.with_quote(&provider, Arc::new(source));
            }

            info!(providers = ?sources.providers(), "Using simulated sources");
            Ok(sources)
        }
        SourceMode::Live => {
            let reference = binance::BinanceReferenceSource::new(&config.sources.reference_url)?;
            let mut sources = Sources::new(Arc::new(reference));

            for (provider, endpoint) in &config.sources.quote_endpoints {
                let api_key = match &endpoint.api_key_env {
                    Some(env) => Some(
                        AppConfig::resolve_env(env)
                            .with_context(|| format!("API key for quote provider {provider}"))?,
                    ),
                    None => None,
                };
                let source = aggregator::HttpQuoteSource::new(provider, &endpoint.url, api_key)?;
                sources = sources.with_quote(provider, Arc::new(source));
            }

            info!(providers = ?sources.providers(), "Using live sources");
            Ok(sources)
        }
    }
}

/// Every provider id mentioned by tokens, per-provider policies or the
/// global fallback, lower-cased and deduplicated.
fn configured_providers(config: &AppConfig) -> Vec<String> {
    let mut ids: Vec<String> = config
        .tokens()
        .iter()
        .flat_map(|t| t.routes.iter().map(|r| r.provider.to_lowercase()))
        .chain(config.providers.keys().map(|k| k.to_lowercase()))
        .chain(
            config
                .providers
                .values()
                .filter_map(|p| p.fallback_provider.as_ref())
                .map(|p| p.to_lowercase()),
        )
        .chain(config.fallback.provider.iter().map(|p| p.to_lowercase()))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
