//! Scripted sources for integration testing.
//!
//! Deterministic `ReferencePriceSource` / `QuoteSource` implementations
//! whose latency and outcome are fixed up front, plus a consumer that
//! records every event with the (paused) clock reading it arrived at.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use routescan::config::{ProviderConfig, ScanSettings, ScheduleMode};
use routescan::engine::sink::RouteEventConsumer;
use routescan::engine::ScanReport;
use routescan::sources::{QuoteSource, ReferencePriceSource, Sources};
use routescan::types::*;

// ---------------------------------------------------------------------------
// Quote source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Script {
    Respond { after: Duration, amount_out: f64 },
    Fail { after: Duration, message: &'static str },
    /// Never resolves.
    Hang,
}

pub struct ScriptedQuote {
    script: Script,
    calls: AtomicUsize,
    created: Instant,
    /// Clock offset of every call, in arrival order.
    dispatched: Mutex<Vec<Duration>>,
}

impl ScriptedQuote {
    pub fn respond(after_ms: u64, amount_out: f64) -> Arc<Self> {
        Self::new(Script::Respond {
            after: Duration::from_millis(after_ms),
            amount_out,
        })
    }

    pub fn fail(after_ms: u64, message: &'static str) -> Arc<Self> {
        Self::new(Script::Fail {
            after: Duration::from_millis(after_ms),
            message,
        })
    }

    pub fn hang() -> Arc<Self> {
        Self::new(Script::Hang)
    }

    fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            created: Instant::now(),
            dispatched: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn dispatch_times(&self) -> Vec<Duration> {
        self.dispatched.lock().clone()
    }
}

#[async_trait]
impl QuoteSource for ScriptedQuote {
    async fn fetch_quote(&self, _request: &QuoteRequest) -> Result<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.dispatched.lock().push(self.created.elapsed());
        match &self.script {
            Script::Respond { after, amount_out } => {
                tokio::time::sleep(*after).await;
                Ok(Quote {
                    amount_out: *amount_out,
                    price_impact_bps: None,
                })
            }
            Script::Fail { after, message } => {
                tokio::time::sleep(*after).await;
                Err(anyhow!("{message}"))
            }
            Script::Hang => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Reference source
// ---------------------------------------------------------------------------

pub struct ScriptedReference {
    snapshot: ReferencePriceSnapshot,
    /// Number of leading calls that fail before answering.
    failures: usize,
    calls: AtomicUsize,
}

impl ScriptedReference {
    /// Answers `{1, 1, 1, 1}` immediately.
    pub fn flat() -> Arc<Self> {
        Self::failing_first(0)
    }

    pub fn failing_first(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            snapshot: ReferencePriceSnapshot {
                left_buy: 1.0,
                left_sell: 1.0,
                right_buy: 1.0,
                right_sell: 1.0,
            },
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReferencePriceSource for ScriptedReference {
    async fn fetch_reference_price(&self, _token: &Token) -> Result<ReferencePriceSnapshot> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            return Err(anyhow!("HTTP 503 from reference venue"));
        }
        Ok(self.snapshot)
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

pub struct RecordingConsumer {
    started: Instant,
    events: Mutex<Vec<(Duration, RouteEvent)>>,
    progress: Mutex<Vec<ScanProgress>>,
    reports: Mutex<Vec<ScanReport>>,
}

impl RecordingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            events: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(Duration, RouteEvent)> {
        self.events.lock().clone()
    }

    pub fn terminal_events(&self) -> Vec<(Duration, RouteEvent)> {
        self.events()
            .into_iter()
            .filter(|(_, e)| e.status.is_terminal())
            .collect()
    }

    /// Events for one token, in arrival order.
    pub fn for_token(&self, token_id: &str) -> Vec<RouteEvent> {
        self.events()
            .into_iter()
            .map(|(_, e)| e)
            .filter(|e| {
                e.token_id.as_deref() == Some(token_id)
                    || e.key
                        .as_ref()
                        .is_some_and(|k| k.as_str().starts_with(&format!("{token_id}|")))
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<ScanProgress> {
        self.progress.lock().clone()
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().len()
    }
}

impl RouteEventConsumer for RecordingConsumer {
    fn on_event(&self, event: &RouteEvent) {
        self.events.lock().push((self.started.elapsed(), event.clone()));
    }

    fn on_progress(&self, progress: &ScanProgress) {
        self.progress.lock().push(progress.clone());
    }

    fn on_report(&self, report: &ScanReport) {
        self.reports.lock().push(report.clone());
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// An Ethereum token with one route per `(provider, direction)`.
pub fn token(id: &str, routes: &[(&str, Direction)]) -> Token {
    Token {
        id: id.to_string(),
        chain: "ethereum".to_string(),
        venue: "binance".to_string(),
        left: Leg {
            symbol: id.to_string(),
            contract: "0x6982508145454ce325ddbe47a25d4ec3d2311933".to_string(),
            decimals: 18,
        },
        right: Leg {
            symbol: "USDT".to_string(),
            contract: "0xdac17f958d2ee523a2206206994597c13d831ec7".to_string(),
            decimals: 6,
        },
        routes: routes
            .iter()
            .map(|(provider, direction)| RouteSpec {
                provider: provider.to_string(),
                direction: *direction,
                amount: 500.0,
            })
            .collect(),
    }
}

/// Settings with every pacing delay removed; tests opt back in.
pub fn fast_settings() -> ScanSettings {
    let mut s = ScanSettings::default();
    s.schedule = ScheduleMode::Concurrent;
    s.inter_token_delay = Duration::ZERO;
    s.inter_group_delay = Duration::ZERO;
    s.default_rate_delay = Duration::ZERO;
    s.rate_delays.clear();
    s.safety_margin = Duration::from_millis(250);
    s.completion_grace = Duration::from_millis(500);
    s
}

pub fn provider(timeout_ms: u64, fallback: Option<&str>) -> ProviderConfig {
    ProviderConfig {
        timeout_ms: Some(timeout_ms),
        fallback: fallback.is_some(),
        fallback_timeout_ms: Some(1_000),
        fallback_provider: fallback.map(str::to_string),
    }
}

pub fn sources(
    reference: Arc<ScriptedReference>,
    quotes: &[(&str, Arc<ScriptedQuote>)],
) -> Sources {
    quotes.iter().fold(Sources::new(reference), |s, (name, q)| {
        s.with_quote(name, q.clone())
    })
}
