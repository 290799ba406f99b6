//! Per-provider request spacing.
//!
//! [`RateLimiter`] is a pure lookup over configuration. [`DispatchPacer`]
//! is the per-run schedule built on top of it: every dispatch to a provider
//! reserves the next free instant, so concurrent units targeting the same
//! provider go out `delay` apart instead of all at once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::ScanSettings;

#[derive(Debug, Clone)]
pub struct RateLimiter {
    default_delay: Duration,
    /// Keys are lower-cased provider ids.
    per_provider: HashMap<String, Duration>,
}

impl RateLimiter {
    pub fn new(default_delay: Duration, per_provider: HashMap<String, Duration>) -> Self {
        let per_provider = per_provider
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            default_delay,
            per_provider,
        }
    }

    pub fn from_settings(settings: &ScanSettings) -> Self {
        Self::new(settings.default_rate_delay, settings.rate_delays.clone())
    }

    /// Minimum spacing before dispatching to `provider` (case-insensitive).
    pub fn delay(&self, provider: &str) -> Duration {
        self.per_provider
            .get(&provider.to_lowercase())
            .copied()
            .unwrap_or(self.default_delay)
    }
}

/// Next allowed dispatch instant per lower-cased provider, for one run.
#[derive(Debug, Default)]
pub struct DispatchPacer {
    next: Mutex<HashMap<String, Instant>>,
}

impl DispatchPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a dispatch slot for `provider`: `max(now, next)`, after which
    /// the provider's next slot moves `delay` further out.
    pub fn reserve(&self, provider: &str, delay: Duration) -> Instant {
        let now = Instant::now();
        let mut next = self.next.lock();
        let entry = next.entry(provider.to_lowercase()).or_insert(now);
        let at = (*entry).max(now);
        *entry = at + delay;
        at
    }
}
