//! Core engine: the scheduler → pipeline → unit → sink orchestration.
//!
//! [`ScanEngine`] owns the long-lived collaborators (settings, sources, the
//! caller's token book, the event consumer). Every call to
//! [`ScanEngine::run`] builds a fresh [`RunContext`] holding the per-run
//! tables (slots, watchdogs, dispatch pacer, result queue, unit and call
//! trackers, counters), so nothing is shared between runs and nothing is
//! global.

pub mod pipeline;
pub mod rate_limiter;
pub mod scheduler;
pub mod sink;
pub mod slots;
pub mod unit;
pub mod watchdog;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ScanSettings;
use crate::sources::Sources;
use crate::types::{duration_ms, QueueItem, RouteStatus, ScanProgress, Token};
use rate_limiter::{DispatchPacer, RateLimiter};
use scheduler::{GroupTiming, ProgressTracker};
use sink::{Clock, DrainStats, ResultSink, RouteEventConsumer, SystemClock};
use slots::{RouteSlot, SlotTable};
use watchdog::{AlwaysVisible, Visibility, WatchdogManager};

// ---------------------------------------------------------------------------
// Shared handles
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag, checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The caller's live token set. Tokens may be added or removed while a
/// scan runs; the engine re-checks membership before doing work.
#[derive(Debug, Clone, Default)]
pub struct TokenBook {
    tokens: Arc<RwLock<Vec<Token>>>,
}

impl TokenBook {
    pub fn new(tokens: Vec<Token>) -> Self {
        let book = Self::default();
        for token in tokens {
            book.insert(token);
        }
        book
    }

    /// Insert or replace by id.
    pub fn insert(&self, token: Token) {
        let mut tokens = self.tokens.write();
        match tokens.iter_mut().find(|t| t.id == token.id) {
            Some(existing) => *existing = token,
            None => tokens.push(token),
        }
    }

    pub fn remove(&self, id: &str) -> Option<Token> {
        let mut tokens = self.tokens.write();
        let pos = tokens.iter().position(|t| t.id == id)?;
        Some(tokens.remove(pos))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tokens.read().iter().any(|t| t.id == id)
    }

    pub fn get(&self, id: &str) -> Option<Token> {
        self.tokens.read().iter().find(|t| t.id == id).cloned()
    }

    /// Snapshot of all tokens in insertion order.
    pub fn tokens(&self) -> Vec<Token> {
        self.tokens.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts detached tasks still running (dispatched units, network calls).
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<InFlightInner>,
}

#[derive(Debug, Default)]
struct InFlightInner {
    count: AtomicUsize,
    idle: Notify,
}

pub struct InFlightGuard {
    inner: Arc<InFlightInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl InFlight {
    pub fn enter(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until nothing is in flight, at most `grace`. Returns `true` if idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.inner.idle.notified();
                if self.count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Per-run state
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub(crate) struct RunStats {
    pub success: AtomicU64,
    pub fallback_success: AtomicU64,
    pub error: AtomicU64,
    pub fallback_error: AtomicU64,
    pub failed: AtomicU64,
    pub late_dropped: AtomicU64,
    pub dropped_after_cancel: AtomicU64,
    pub tokens_processed: AtomicU64,
    pub tokens_skipped: AtomicU64,
    pub reference_unavailable: AtomicU64,
}

impl RunStats {
    fn tally(&self, swept: u64) -> OutcomeTally {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        OutcomeTally {
            success: get(&self.success),
            fallback_success: get(&self.fallback_success),
            error: get(&self.error),
            fallback_error: get(&self.fallback_error),
            failed: get(&self.failed),
            swept,
            late_dropped: get(&self.late_dropped),
            dropped_after_cancel: get(&self.dropped_after_cancel),
        }
    }
}

/// Everything one run needs, passed explicitly to every stage.
pub(crate) struct RunContext {
    pub run_id: Uuid,
    pub settings: Arc<ScanSettings>,
    pub sources: Arc<Sources>,
    pub book: TokenBook,
    pub limiter: RateLimiter,
    pub pacer: DispatchPacer,
    pub slots: Arc<SlotTable>,
    pub watchdogs: WatchdogManager,
    pub sink: Arc<ResultSink>,
    pub cancel: CancelFlag,
    /// Units dispatched by token pipelines and not yet settled.
    pub units: InFlight,
    /// Network calls, including ones abandoned by their watchdog.
    pub inflight: InFlight,
    pub stats: RunStats,
}

impl RunContext {
    fn new(
        settings: Arc<ScanSettings>,
        sources: Arc<Sources>,
        book: TokenBook,
        consumer: Arc<dyn RouteEventConsumer>,
        visibility: Arc<dyn Visibility>,
        clock: Arc<dyn Clock>,
        cancel: CancelFlag,
    ) -> Self {
        let slots = Arc::new(SlotTable::new());
        let watchdogs = WatchdogManager::new(
            Arc::clone(&visibility),
            settings.defer_when_hidden,
            settings.probe_interval,
        );
        let sink = Arc::new(ResultSink::new(
            Arc::clone(&slots),
            watchdogs.clone(),
            consumer,
            clock,
            visibility,
            settings.batch_budget,
            settings.sweep_grace,
        ));

        Self {
            run_id: Uuid::new_v4(),
            limiter: RateLimiter::from_settings(&settings),
            pacer: DispatchPacer::new(),
            settings,
            sources,
            book,
            slots,
            watchdogs,
            sink,
            cancel,
            units: InFlight::default(),
            inflight: InFlight::default(),
            stats: RunStats::default(),
        }
    }

    /// Wait for every dispatched unit to settle.
    ///
    /// The bound tracks the latest live deadline, so a route still inside
    /// its window is never cut short; `completion_grace` is the slack past
    /// it. Returns `false` if units are still running once no live deadline
    /// is left within reach.
    pub async fn settle_units(&self) -> bool {
        let grace = self.settings.completion_grace;
        loop {
            let horizon = self
                .slots
                .latest_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or_default();
            if self.units.wait_idle(horizon + grace).await {
                return true;
            }
            match self.slots.latest_deadline() {
                Some(d) if d + grace > Instant::now() => continue,
                _ => return false,
            }
        }
    }

    /// Surface a non-terminal transition when enabled.
    pub fn interim(&self, slot: &RouteSlot, status: RouteStatus) {
        if self.settings.surface_interim {
            self.sink.push(QueueItem::Interim {
                key: slot.key().clone(),
                status,
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(
        settings: ScanSettings,
        sources: Sources,
        book: TokenBook,
        consumer: Arc<dyn RouteEventConsumer>,
    ) -> Arc<Self> {
        Arc::new(Self::new(
            Arc::new(settings),
            Arc::new(sources),
            book,
            consumer,
            Arc::new(AlwaysVisible),
            Arc::new(SystemClock),
            CancelFlag::new(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Terminal outcomes of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub success: u64,
    pub fallback_success: u64,
    pub error: u64,
    pub fallback_error: u64,
    pub failed: u64,
    /// Finalized by the safety sweep.
    pub swept: u64,
    /// Responses that arrived after their route was already final.
    pub late_dropped: u64,
    pub dropped_after_cancel: u64,
}

impl OutcomeTally {
    /// Terminal route items emitted.
    pub fn terminal(&self) -> u64 {
        self.success + self.fallback_success + self.error + self.fallback_error + self.failed + self.swept
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
    pub tokens_total: usize,
    pub tokens_processed: u64,
    pub tokens_skipped: u64,
    pub reference_unavailable: u64,
    pub groups: Vec<GroupTiming>,
    pub outcomes: OutcomeTally,
    pub drain: DrainStats,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ScanEngine {
    settings: Arc<ScanSettings>,
    sources: Arc<Sources>,
    book: TokenBook,
    consumer: Arc<dyn RouteEventConsumer>,
    visibility: Arc<dyn Visibility>,
    clock: Arc<dyn Clock>,
    progress: Arc<watch::Sender<ScanProgress>>,
}

impl ScanEngine {
    pub fn new(
        settings: ScanSettings,
        sources: Sources,
        book: TokenBook,
        consumer: Arc<dyn RouteEventConsumer>,
    ) -> Self {
        let (progress, _) = watch::channel(ScanProgress::default());
        Self {
            settings: Arc::new(settings),
            sources: Arc::new(sources),
            book,
            consumer,
            visibility: Arc::new(AlwaysVisible),
            clock: Arc::new(SystemClock),
            progress: Arc::new(progress),
        }
    }

    pub fn with_visibility(mut self, visibility: Arc<dyn Visibility>) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn book(&self) -> &TokenBook {
        &self.book
    }

    /// Progress of the current (or last) run.
    pub fn subscribe_progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.subscribe()
    }

    /// Run one scan pass over `tokens` to completion or cancellation.
    pub async fn run(&self, tokens: Vec<Token>, cancel: CancelFlag) -> ScanReport {
        let started_at = Utc::now();
        let t0 = Instant::now();

        let mut seen = HashSet::new();
        let tokens: Vec<Arc<Token>> = tokens
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .map(Arc::new)
            .collect();

        let run = Arc::new(RunContext::new(
            Arc::clone(&self.settings),
            Arc::clone(&self.sources),
            self.book.clone(),
            Arc::clone(&self.consumer),
            Arc::clone(&self.visibility),
            Arc::clone(&self.clock),
            cancel,
        ));

        info!(
            run_id = %run.run_id,
            tokens = tokens.len(),
            group_size = self.settings.group_size,
            "Scan started"
        );

        let drain = tokio::spawn(
            Arc::clone(&run.sink).run(self.settings.frame_interval, self.settings.background_interval),
        );

        let tracker = ProgressTracker::new(
            tokens.len(),
            t0,
            Arc::clone(&self.progress),
            Arc::clone(&self.consumer),
        );
        let tokens_total = tokens.len();
        let groups = scheduler::run_groups(&run, tokens, &tracker).await;

        if !run.settle_units().await {
            warn!(
                run_id = %run.run_id,
                units = run.units.count(),
                live_routes = run.slots.live_count(),
                "Completion grace elapsed with routes still unsettled"
            );
        }
        if !run.inflight.wait_idle(self.settings.completion_grace).await {
            warn!(
                run_id = %run.run_id,
                in_flight = run.inflight.count(),
                "Completion grace elapsed with calls still in flight"
            );
        }
        run.watchdogs.clear();
        run.sink.finish();

        let drain = match drain.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Drain task failed");
                DrainStats::default()
            }
        };

        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let report = ScanReport {
            run_id: run.run_id,
            started_at,
            elapsed: t0.elapsed(),
            tokens_total,
            tokens_processed: get(&run.stats.tokens_processed),
            tokens_skipped: get(&run.stats.tokens_skipped),
            reference_unavailable: get(&run.stats.reference_unavailable),
            groups,
            outcomes: run.stats.tally(drain.swept),
            drain,
            cancelled: run.cancel.is_cancelled(),
        };

        info!(
            run_id = %report.run_id,
            elapsed_ms = report.elapsed.as_millis() as u64,
            processed = report.tokens_processed,
            success = report.outcomes.success,
            fallback_success = report.outcomes.fallback_success,
            errors = report.outcomes.error + report.outcomes.fallback_error + report.outcomes.failed,
            cancelled = report.cancelled,
            "Scan finished"
        );
        self.consumer.on_report(&report);
        report
    }

    /// Spawn a run in the background.
    pub fn start(self: &Arc<Self>, tokens: Vec<Token>) -> ScanHandle {
        let cancel = CancelFlag::new();
        let progress = self.subscribe_progress();
        let engine = Arc::clone(self);
        let flag = cancel.clone();
        let task = tokio::spawn(async move { engine.run(tokens, flag).await });
        ScanHandle {
            cancel,
            progress,
            task,
        }
    }
}

/// Handle to a background run.
pub struct ScanHandle {
    cancel: CancelFlag,
    progress: watch::Receiver<ScanProgress>,
    task: JoinHandle<ScanReport>,
}

impl ScanHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn progress(&self) -> watch::Receiver<ScanProgress> {
        self.progress.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn wait(self) -> Result<ScanReport> {
        self.task.await.context("Scan task failed")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
