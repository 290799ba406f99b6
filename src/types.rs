//! Shared types for the ROUTESCAN engine.
//!
//! These types form the data model used across all modules: tokens and
//! their routes, reference price snapshots, quotes, route states, queue
//! items and the error taxonomy. Engine, sources and dashboard modules all
//! depend on this file and nothing here depends on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::pnl::RouteEconomics;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Direction of a route through a quote provider.
///
/// `Forward` buys the left leg on the reference venue and sells it through
/// the provider for the right leg. `Reverse` is the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub const ALL: &'static [Direction] = &[Direction::Forward, Direction::Reverse];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "forward" | "fwd" | "cex-dex" => Ok(Direction::Forward),
            "reverse" | "rev" | "dex-cex" => Ok(Direction::Reverse),
            _ => Err(anyhow::anyhow!("Unknown route direction: {s}")),
        }
    }
}

/// Chains the engine knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    Ethereum,
    Bsc,
    Polygon,
    Arbitrum,
    Optimism,
    Base,
    Avalanche,
    Solana,
}

impl ChainId {
    /// Numeric EVM chain id. `None` for non-EVM chains.
    pub fn evm_id(&self) -> Option<u64> {
        match self {
            ChainId::Ethereum => Some(1),
            ChainId::Bsc => Some(56),
            ChainId::Polygon => Some(137),
            ChainId::Arbitrum => Some(42161),
            ChainId::Optimism => Some(10),
            ChainId::Base => Some(8453),
            ChainId::Avalanche => Some(43114),
            ChainId::Solana => None,
        }
    }

    pub fn is_evm(&self) -> bool {
        self.evm_id().is_some()
    }

    /// Structural address check: `0x` + 40 hex digits on EVM chains,
    /// 32–44 base58 characters on Solana.
    pub fn is_valid_address(&self, address: &str) -> bool {
        let address = address.trim();
        if self.is_evm() {
            address.len() == 42
                && (address.starts_with("0x") || address.starts_with("0X"))
                && address[2..].chars().all(|c| c.is_ascii_hexdigit())
        } else {
            (32..=44).contains(&address.len())
                && address
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l'))
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainId::Ethereum => "ethereum",
            ChainId::Bsc => "bsc",
            ChainId::Polygon => "polygon",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Optimism => "optimism",
            ChainId::Base => "base",
            ChainId::Avalanche => "avalanche",
            ChainId::Solana => "solana",
        };
        write!(f, "{name}")
    }
}

/// Parse a chain name (case-insensitive, common aliases accepted).
impl std::str::FromStr for ChainId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ethereum" | "eth" | "mainnet" | "erc20" | "1" => Ok(ChainId::Ethereum),
            "bsc" | "bnb" | "bep20" | "56" => Ok(ChainId::Bsc),
            "polygon" | "matic" | "137" => Ok(ChainId::Polygon),
            "arbitrum" | "arb" | "42161" => Ok(ChainId::Arbitrum),
            "optimism" | "op" | "10" => Ok(ChainId::Optimism),
            "base" | "8453" => Ok(ChainId::Base),
            "avalanche" | "avax" | "avaxc" | "43114" => Ok(ChainId::Avalanche),
            "solana" | "sol" => Ok(ChainId::Solana),
            _ => Err(anyhow::anyhow!("Unknown chain: {s}")),
        }
    }
}

/// Lifecycle of one route within a scan run.
///
/// `Pending → Checking → {Success | Fallback → {Success | FallbackError} | Error}`,
/// or `Pending → Failed` when the readiness check rejects the route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteStatus {
    Pending,
    Checking,
    Fallback,
    Success,
    Error,
    FallbackError,
    Failed,
}

impl RouteStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RouteStatus::Success
                | RouteStatus::Error
                | RouteStatus::FallbackError
                | RouteStatus::Failed
        )
    }
}

impl fmt::Display for RouteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteStatus::Pending => write!(f, "pending"),
            RouteStatus::Checking => write!(f, "checking"),
            RouteStatus::Fallback => write!(f, "fallback"),
            RouteStatus::Success => write!(f, "success"),
            RouteStatus::Error => write!(f, "error"),
            RouteStatus::FallbackError => write!(f, "fallback-error"),
            RouteStatus::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokens & routes
// ---------------------------------------------------------------------------

/// One side of a token pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leg {
    pub symbol: String,
    pub contract: String,
    pub decimals: u8,
}

/// A configured (provider, direction) pair with its trade amount in USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSpec {
    pub provider: String,
    pub direction: Direction,
    pub amount: f64,
}

/// A token scanned by the engine. Owned by the caller, read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub id: String,
    /// Chain name as configured; resolved during the readiness check.
    pub chain: String,
    /// Reference (centralised) venue, e.g. "binance".
    pub venue: String,
    pub left: Leg,
    pub right: Leg,
    pub routes: Vec<RouteSpec>,
}

impl Token {
    /// Distinct provider ids configured on this token, in first-seen order.
    pub fn providers(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for spec in &self.routes {
            if !seen.iter().any(|p| p.eq_ignore_ascii_case(&spec.provider)) {
                seen.push(&spec.provider);
            }
        }
        seen
    }

    /// Routes to dispatch, restricted to `allow_list` (empty = everything).
    pub fn routes_for(&self, allow_list: &[String]) -> Vec<Route> {
        self.routes
            .iter()
            .filter(|spec| {
                allow_list.is_empty()
                    || allow_list.iter().any(|p| p.eq_ignore_ascii_case(&spec.provider))
            })
            .map(|spec| Route {
                token_id: self.id.clone(),
                venue: self.venue.clone(),
                provider: spec.provider.clone(),
                direction: spec.direction,
                amount: spec.amount,
            })
            .collect()
    }

    /// Human label used in progress events.
    pub fn label(&self) -> String {
        format!("{} ({}/{})", self.id, self.left.symbol, self.right.symbol)
    }
}

/// One directional quote path for a token through one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub token_id: String,
    pub venue: String,
    pub provider: String,
    pub direction: Direction,
    /// Trade amount in USD.
    pub amount: f64,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey::new(&self.token_id, &self.venue, &self.provider, self.direction)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}→{} {} ${:.2}",
            self.token_id, self.venue, self.provider, self.direction, self.amount
        )
    }
}

/// Stable composite identity of a route.
///
/// Used for watchdog keys, result-slot identity and finalize-once checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(token_id: &str, venue: &str, provider: &str, direction: Direction) -> Self {
        Self(format!(
            "{}|{}|{}|{}",
            token_id,
            venue.to_lowercase(),
            provider.to_lowercase(),
            direction
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Watchdog key for the primary attempt.
    pub fn primary_watchdog(&self) -> String {
        format!("{}#primary", self.0)
    }

    /// Watchdog key for the fallback attempt.
    pub fn fallback_watchdog(&self) -> String {
        format!("{}#fallback", self.0)
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Prices & quotes
// ---------------------------------------------------------------------------

/// Reference (centralised venue) prices for both legs, in USD.
///
/// Produced once per token per scan pass and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferencePriceSnapshot {
    /// Price paid to buy the left leg (ask).
    pub left_buy: f64,
    /// Price received selling the left leg (bid).
    pub left_sell: f64,
    pub right_buy: f64,
    pub right_sell: f64,
}

impl ReferencePriceSnapshot {
    /// All four prices finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        [self.left_buy, self.left_sell, self.right_buy, self.right_sell]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
    }

    /// Price paid on the venue for the leg that enters the provider.
    pub fn entry_price(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Forward => self.left_buy,
            Direction::Reverse => self.right_buy,
        }
    }
}

impl fmt::Display for ReferencePriceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L {:.6}/{:.6} R {:.6}/{:.6}",
            self.left_buy, self.left_sell, self.right_buy, self.right_sell
        )
    }
}

/// Everything a quote source needs to answer for one route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub key: RouteKey,
    /// Provider this request is addressed to (primary or fallback).
    pub provider: String,
    pub direction: Direction,
    pub chain: ChainId,
    pub token_in: Leg,
    pub token_out: Leg,
    /// Input quantity in human units of `token_in`.
    pub amount_in: f64,
    /// Input quantity in base units (`amount_in × 10^decimals`).
    pub amount_in_raw: u128,
}

/// A provider's answer: how much `token_out` the input buys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Output quantity in human units of `token_out`.
    pub amount_out: f64,
    #[serde(default)]
    pub price_impact_bps: Option<u32>,
}

impl Quote {
    pub fn is_valid(&self) -> bool {
        self.amount_out.is_finite() && self.amount_out > 0.0
    }
}

// ---------------------------------------------------------------------------
// Results, errors & queue items
// ---------------------------------------------------------------------------

/// Successful terminal outcome of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub key: RouteKey,
    pub route: Route,
    pub quote: Quote,
    /// Set when the answer came from a fallback provider.
    pub fallback_provider: Option<String>,
    pub snapshot: ReferencePriceSnapshot,
    pub economics: RouteEconomics,
}

impl RouteResult {
    /// Provider that actually answered.
    pub fn answered_by(&self) -> &str {
        self.fallback_provider.as_deref().unwrap_or(&self.route.provider)
    }
}

/// Error taxonomy surfaced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ReadinessRejected,
    UpstreamFailure,
    Timeout,
    FallbackExhausted,
    ReferenceUnavailable,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ReadinessRejected => write!(f, "readiness-rejected"),
            ErrorKind::UpstreamFailure => write!(f, "upstream-failure"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::FallbackExhausted => write!(f, "fallback-exhausted"),
            ErrorKind::ReferenceUnavailable => write!(f, "reference-unavailable"),
        }
    }
}

/// Failed terminal outcome of a route, or of a whole token when `key` is `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteError {
    pub token_id: String,
    pub key: Option<RouteKey>,
    pub provider: Option<String>,
    pub direction: Option<Direction>,
    pub kind: ErrorKind,
    /// What ended the last attempt of a fallback-exhausted route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<ErrorKind>,
    pub status: RouteStatus,
    pub message: String,
}

impl RouteError {
    /// Build a route-level error from a [`ScanError`].
    pub fn for_route(route: &Route, status: RouteStatus, error: &ScanError) -> Self {
        Self {
            token_id: route.token_id.clone(),
            key: Some(route.key()),
            provider: Some(route.provider.clone()),
            direction: Some(route.direction),
            kind: error.kind(),
            cause: error.cause(),
            status,
            message: error.to_string(),
        }
    }

    /// Build the token-level aggregate failure.
    pub fn for_token(token_id: &str, error: &ScanError) -> Self {
        Self {
            token_id: token_id.to_string(),
            key: None,
            provider: None,
            direction: None,
            kind: error.kind(),
            cause: error.cause(),
            status: RouteStatus::Failed,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.provider, &self.direction) {
            (Some(p), Some(d)) => write!(f, "[{} {p} {d}] {}", self.token_id, self.message),
            _ => write!(f, "[{}] {}", self.token_id, self.message),
        }
    }
}

/// Unit of work handed from quote request units to the result sink.
#[derive(Debug, Clone)]
pub enum QueueItem {
    Resolved(RouteResult),
    Rejected(RouteError),
    /// Non-terminal transition (`Checking`, `Fallback`), only when enabled.
    Interim { key: RouteKey, status: RouteStatus },
}

impl QueueItem {
    pub fn key(&self) -> Option<&RouteKey> {
        match self {
            QueueItem::Resolved(r) => Some(&r.key),
            QueueItem::Rejected(e) => e.key.as_ref(),
            QueueItem::Interim { key, .. } => Some(key),
        }
    }

    pub fn status(&self) -> RouteStatus {
        match self {
            QueueItem::Resolved(_) => RouteStatus::Success,
            QueueItem::Rejected(e) => e.status,
            QueueItem::Interim { status, .. } => *status,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Consumer-facing route-state event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEvent {
    pub key: Option<RouteKey>,
    pub token_id: Option<String>,
    pub status: RouteStatus,
    pub result: Option<RouteResult>,
    pub error: Option<RouteError>,
    pub at: DateTime<Utc>,
}

impl From<QueueItem> for RouteEvent {
    fn from(item: QueueItem) -> Self {
        let at = Utc::now();
        match item {
            QueueItem::Resolved(result) => RouteEvent {
                key: Some(result.key.clone()),
                token_id: Some(result.route.token_id.clone()),
                status: RouteStatus::Success,
                result: Some(result),
                error: None,
                at,
            },
            QueueItem::Rejected(error) => RouteEvent {
                key: error.key.clone(),
                token_id: Some(error.token_id.clone()),
                status: error.status,
                result: None,
                error: Some(error),
                at,
            },
            QueueItem::Interim { key, status } => RouteEvent {
                key: Some(key),
                token_id: None,
                status,
                result: None,
                error: None,
                at,
            },
        }
    }
}

/// Scan progress, emitted after each token settles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub completed: usize,
    pub total: usize,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub current_label: String,
}

impl ScanProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the scan engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("Readiness rejected: {0}")]
    ReadinessRejected(String),

    #[error("Upstream failure ({provider}): {message}")]
    UpstreamFailure { provider: String, message: String },

    #[error("Timeout ({provider}): no response within {after_ms}ms")]
    Timeout { provider: String, after_ms: u64 },

    #[error("Fallback exhausted ({provider} → {fallback}): {message}")]
    FallbackExhausted {
        provider: String,
        fallback: String,
        /// `Timeout` or `UpstreamFailure` of the fallback attempt.
        cause: ErrorKind,
        message: String,
    },

    #[error("Reference price unavailable after {attempts} attempts: {message}")]
    ReferenceUnavailable { attempts: u32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ScanError {
    /// Taxonomy bucket for consumers. Configuration errors never reach a
    /// route and are reported as readiness rejections if they do.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScanError::ReadinessRejected(_) | ScanError::Config(_) => ErrorKind::ReadinessRejected,
            ScanError::UpstreamFailure { .. } => ErrorKind::UpstreamFailure,
            ScanError::Timeout { .. } => ErrorKind::Timeout,
            ScanError::FallbackExhausted { .. } => ErrorKind::FallbackExhausted,
            ScanError::ReferenceUnavailable { .. } => ErrorKind::ReferenceUnavailable,
        }
    }

    /// Underlying failure of a fallback-exhausted route.
    pub fn cause(&self) -> Option<ErrorKind> {
        match self {
            ScanError::FallbackExhausted { cause, .. } => Some(*cause),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
