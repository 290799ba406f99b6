//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section carries serde defaults so a minimal file only needs `[[tokens]]`.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.
//!
//! [`ScanSettings`] is the resolved, engine-facing view: durations instead
//! of millisecond integers and lower-cased provider maps.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use crate::types::{Direction, Leg, RouteSpec, ScanError, Token};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// How tokens within a group are started.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    /// All tokens of a group start at once.
    Concurrent,
    /// Token `i` of a group starts after `i × inter_token_delay`.
    #[default]
    Staggered,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScanConfig {
    /// Seconds between scan passes (binary only).
    pub interval_secs: u64,
    pub group_size: usize,
    pub schedule: ScheduleMode,
    pub inter_token_delay_ms: u64,
    pub inter_group_delay_ms: u64,
    /// Upper bound on waiting for straggling network calls at the end of a run.
    pub completion_grace_ms: u64,
    /// Surface `Checking`/`Fallback` transitions to the consumer.
    pub surface_interim: bool,
    /// Providers allowed to run. Empty = all configured providers.
    pub active_providers: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            group_size: 5,
            schedule: ScheduleMode::Staggered,
            inter_token_delay_ms: 150,
            inter_group_delay_ms: 1_000,
            completion_grace_ms: 3_000,
            surface_interim: false,
            active_providers: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    /// Default provider timeout.
    pub timeout_ms: u64,
    /// Added on top of every provider timeout before the watchdog fires.
    pub safety_margin_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8_000,
            safety_margin_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReferenceConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Per-try bound on the reference price request.
    pub timeout_ms: u64,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 500,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitConfig {
    pub default_delay_ms: u64,
    /// Per-provider minimum spacing. Keys are matched case-insensitively.
    pub providers: HashMap<String, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_delay_ms: 100,
            providers: HashMap::new(),
        }
    }
}

/// Per-provider policy overrides.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProviderConfig {
    pub timeout_ms: Option<u64>,
    /// Whether a failed or timed-out primary attempt may try a fallback.
    pub fallback: bool,
    pub fallback_timeout_ms: Option<u64>,
    pub fallback_provider: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FallbackConfig {
    /// Default fallback provider for fallback-enabled providers.
    pub provider: Option<String>,
    pub timeout_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            provider: None,
            timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SinkConfig {
    /// Time budget of one drain batch.
    pub batch_budget_ms: u64,
    /// Pacing while the consumer is observable.
    pub frame_interval_ms: u64,
    /// Pacing while the consumer is hidden.
    pub background_interval_ms: u64,
    /// How far past its deadline a slot may run before the sweep finalizes it.
    pub sweep_grace_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            batch_budget_ms: 12,
            frame_interval_ms: 16,
            background_interval_ms: 250,
            sweep_grace_ms: 1_500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Defer firing while the consumer is not observable.
    pub defer_when_hidden: bool,
    pub probe_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            defer_when_hidden: false,
            probe_interval_ms: 1_000,
        }
    }
}

/// Which adapters back the engine.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Simulated,
    Live,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SourcesConfig {
    pub mode: SourceMode,
    pub reference_url: String,
    /// Quote endpoints by provider id (live mode).
    pub quote_endpoints: HashMap<String, QuoteEndpointConfig>,
    /// Simulated latency per quote (simulated mode).
    pub simulated_latency_ms: u64,
    /// Providers that always fail (simulated mode).
    pub simulated_failing: Vec<String>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            mode: SourceMode::Simulated,
            reference_url: "https://api.binance.com".to_string(),
            quote_endpoints: HashMap::new(),
            simulated_latency_ms: 250,
            simulated_failing: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuoteEndpointConfig {
    pub url: String,
    /// Name of the env var holding the API key, if the endpoint needs one.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8088,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LegConfig {
    pub symbol: String,
    pub contract: String,
    pub decimals: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub provider: String,
    pub direction: Direction,
    pub amount: f64,
}

/// A token entry. Either list `routes` explicitly or use the
/// `providers` × `directions` × `amount` shorthand.
#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub id: String,
    pub chain: String,
    #[serde(default = "default_venue")]
    pub venue: String,
    pub left: LegConfig,
    pub right: LegConfig,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub directions: Option<Vec<Direction>>,
    #[serde(default)]
    pub amount: f64,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

fn default_venue() -> String {
    "binance".to_string()
}

impl TokenConfig {
    pub fn to_token(&self) -> Token {
        let leg = |l: &LegConfig| Leg {
            symbol: l.symbol.clone(),
            contract: l.contract.clone(),
            decimals: l.decimals,
        };

        let routes = if !self.routes.is_empty() {
            self.routes
                .iter()
                .map(|r| RouteSpec {
                    provider: r.provider.clone(),
                    direction: r.direction,
                    amount: r.amount,
                })
                .collect()
        } else {
            let directions = self
                .directions
                .clone()
                .unwrap_or_else(|| Direction::ALL.to_vec());
            self.providers
                .iter()
                .flat_map(|p| {
                    directions.iter().map(move |d| RouteSpec {
                        provider: p.clone(),
                        direction: *d,
                        amount: self.amount,
                    })
                })
                .collect()
        };

        Token {
            id: self.id.clone(),
            chain: self.chain.clone(),
            venue: self.venue.clone(),
            left: leg(&self.left),
            right: leg(&self.right),
            routes,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ScanError> {
        if self.scan.group_size == 0 {
            return Err(ScanError::Config("scan.group_size must be >= 1".into()));
        }
        if self.reference.max_attempts == 0 {
            return Err(ScanError::Config("reference.max_attempts must be >= 1".into()));
        }
        if self.sink.batch_budget_ms == 0 {
            return Err(ScanError::Config("sink.batch_budget_ms must be > 0".into()));
        }
        if self.sink.frame_interval_ms == 0 || self.sink.background_interval_ms == 0 {
            return Err(ScanError::Config("sink pacing intervals must be > 0".into()));
        }
        if self.watchdog.probe_interval_ms == 0 {
            return Err(ScanError::Config("watchdog.probe_interval_ms must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for token in &self.tokens {
            if !seen.insert(token.id.as_str()) {
                return Err(ScanError::Config(format!("duplicate token id: {}", token.id)));
            }
        }
        Ok(())
    }

    /// All configured tokens as engine tokens.
    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.iter().map(TokenConfig::to_token).collect()
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

// ---------------------------------------------------------------------------
// Resolved engine settings
// ---------------------------------------------------------------------------

/// Timeout and fallback policy for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPolicy {
    /// Primary watchdog window (provider timeout + safety margin).
    pub dispatch_timeout: Duration,
    /// Lower-cased fallback provider id; `None` disables the fallback path.
    pub fallback_provider: Option<String>,
    pub fallback_timeout: Duration,
}

/// Engine-facing settings with all units resolved.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub group_size: usize,
    pub schedule: ScheduleMode,
    pub inter_token_delay: Duration,
    pub inter_group_delay: Duration,
    pub completion_grace: Duration,
    pub surface_interim: bool,
    pub active_providers: Vec<String>,

    pub default_timeout: Duration,
    pub safety_margin: Duration,
    pub providers: HashMap<String, ProviderConfig>,
    pub default_fallback: Option<String>,
    pub default_fallback_timeout: Duration,

    pub reference_attempts: u32,
    pub reference_retry_delay: Duration,
    pub reference_timeout: Duration,

    pub default_rate_delay: Duration,
    pub rate_delays: HashMap<String, Duration>,

    pub batch_budget: Duration,
    pub frame_interval: Duration,
    pub background_interval: Duration,
    pub sweep_grace: Duration,

    pub defer_when_hidden: bool,
    pub probe_interval: Duration,
}

impl ScanSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let ms = Duration::from_millis;
        Self {
            group_size: cfg.scan.group_size.max(1),
            schedule: cfg.scan.schedule,
            inter_token_delay: ms(cfg.scan.inter_token_delay_ms),
            inter_group_delay: ms(cfg.scan.inter_group_delay_ms),
            completion_grace: ms(cfg.scan.completion_grace_ms),
            surface_interim: cfg.scan.surface_interim,
            active_providers: cfg.scan.active_providers.iter().map(|p| p.to_lowercase()).collect(),

            default_timeout: ms(cfg.dispatch.timeout_ms),
            safety_margin: ms(cfg.dispatch.safety_margin_ms),
            providers: cfg
                .providers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            default_fallback: cfg.fallback.provider.as_ref().map(|p| p.to_lowercase()),
            default_fallback_timeout: ms(cfg.fallback.timeout_ms),

            reference_attempts: cfg.reference.max_attempts.max(1),
            reference_retry_delay: ms(cfg.reference.retry_delay_ms),
            reference_timeout: ms(cfg.reference.timeout_ms),

            default_rate_delay: ms(cfg.rate_limit.default_delay_ms),
            rate_delays: cfg
                .rate_limit
                .providers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), ms(*v)))
                .collect(),

            batch_budget: ms(cfg.sink.batch_budget_ms),
            frame_interval: ms(cfg.sink.frame_interval_ms),
            background_interval: ms(cfg.sink.background_interval_ms),
            sweep_grace: ms(cfg.sink.sweep_grace_ms),

            defer_when_hidden: cfg.watchdog.defer_when_hidden,
            probe_interval: ms(cfg.watchdog.probe_interval_ms),
        }
    }

    /// Timeout and fallback policy for `provider` (case-insensitive).
    pub fn policy(&self, provider: &str) -> ProviderPolicy {
        let key = provider.to_lowercase();
        let entry = self.providers.get(&key);

        let timeout = entry
            .and_then(|p| p.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        let fallback_provider = entry
            .filter(|p| p.fallback)
            .and_then(|p| {
                p.fallback_provider
                    .as_ref()
                    .map(|f| f.to_lowercase())
                    .or_else(|| self.default_fallback.clone())
            })
            .filter(|f| *f != key);

        let fallback_timeout = entry
            .and_then(|p| p.fallback_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.default_fallback_timeout);

        ProviderPolicy {
            dispatch_timeout: timeout + self.safety_margin,
            fallback_provider,
            fallback_timeout,
        }
    }
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
