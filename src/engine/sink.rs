//! Result sink (update queue).
//!
//! Units push [`QueueItem`]s from any task without blocking. A single drain
//! task pops them in time-boxed batches and hands them to the
//! [`RouteEventConsumer`], pacing itself at the frame interval while the
//! consumer is observable and at the coarser background interval while it
//! is hidden. Each cycle also runs the safety sweep over overdue slots.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::slots::SlotTable;
use super::watchdog::{Visibility, WatchdogManager};
use super::ScanReport;
use crate::types::{QueueItem, RouteError, RouteEvent, RouteStatus, ScanError, ScanProgress};

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// The observability collaborator that receives route-state events.
pub trait RouteEventConsumer: Send + Sync {
    fn on_event(&self, event: &RouteEvent);

    fn on_progress(&self, _progress: &ScanProgress) {}

    fn on_report(&self, _report: &ScanReport) {}
}

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsumer;

impl RouteEventConsumer for TracingConsumer {
    fn on_event(&self, event: &RouteEvent) {
        let key = event.key.as_ref().map(|k| k.as_str()).unwrap_or("-");
        match (&event.result, &event.error) {
            (Some(result), _) => info!(
                key,
                provider = result.answered_by(),
                amount_out = result.quote.amount_out,
                pnl_usd = %result.economics.pnl_usd,
                pnl_bps = result.economics.pnl_bps,
                "Route priced"
            ),
            (None, Some(error)) => warn!(
                key,
                kind = %error.kind,
                status = %error.status,
                "{}",
                error.message
            ),
            (None, None) => debug!(key, status = %event.status, "Route transition"),
        }
    }

    fn on_progress(&self, progress: &ScanProgress) {
        debug!(
            completed = progress.completed,
            total = progress.total,
            elapsed_ms = progress.elapsed.as_millis() as u64,
            current = %progress.current_label,
            "Scan progress"
        );
    }
}

/// Forwards to several consumers in order.
#[derive(Default, Clone)]
pub struct Fanout {
    consumers: Vec<Arc<dyn RouteEventConsumer>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, consumer: Arc<dyn RouteEventConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }
}

impl RouteEventConsumer for Fanout {
    fn on_event(&self, event: &RouteEvent) {
        for c in &self.consumers {
            c.on_event(event);
        }
    }

    fn on_progress(&self, progress: &ScanProgress) {
        for c in &self.consumers {
            c.on_progress(progress);
        }
    }

    fn on_report(&self, report: &ScanReport) {
        for c in &self.consumers {
            c.on_report(report);
        }
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for the batch budget.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// One drain invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub drained: usize,
    /// Budget clock reading at the check that ended the batch.
    pub elapsed: Duration,
    pub remaining: usize,
}

/// Totals over a whole run of the drain loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainStats {
    pub batches: u64,
    pub items: u64,
    pub max_batch_items: usize,
    #[serde(with = "crate::types::duration_ms")]
    pub max_batch_elapsed: Duration,
    pub swept: u64,
}

impl DrainStats {
    fn record(&mut self, batch: &BatchStats) {
        if batch.drained == 0 {
            return;
        }
        self.batches += 1;
        self.items += batch.drained as u64;
        self.max_batch_items = self.max_batch_items.max(batch.drained);
        self.max_batch_elapsed = self.max_batch_elapsed.max(batch.elapsed);
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

pub struct ResultSink {
    queue: Mutex<VecDeque<QueueItem>>,
    slots: Arc<SlotTable>,
    watchdogs: WatchdogManager,
    consumer: Arc<dyn RouteEventConsumer>,
    clock: Arc<dyn Clock>,
    visibility: Arc<dyn Visibility>,
    budget: Duration,
    sweep_grace: Duration,
    finished: AtomicBool,
    swept: AtomicU64,
}

impl ResultSink {
    pub fn new(
        slots: Arc<SlotTable>,
        watchdogs: WatchdogManager,
        consumer: Arc<dyn RouteEventConsumer>,
        clock: Arc<dyn Clock>,
        visibility: Arc<dyn Visibility>,
        budget: Duration,
        sweep_grace: Duration,
    ) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            slots,
            watchdogs,
            consumer,
            clock,
            visibility,
            budget,
            sweep_grace,
            finished: AtomicBool::new(false),
            swept: AtomicU64::new(0),
        }
    }

    /// Enqueue an item. Never blocks beyond the queue lock.
    pub fn push(&self, item: QueueItem) {
        if item.is_terminal() {
            if let Some(slot) = item.key().and_then(|k| self.slots.get(k)) {
                slot.mark_queued();
            }
        }
        self.queue.lock().push_back(item);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// No more work will be scheduled; the drain loop exits once empty.
    pub fn finish(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn swept_count(&self) -> u64 {
        self.swept.load(Ordering::Relaxed)
    }

    /// Drain until the queue is empty or the budget is spent.
    ///
    /// The budget is checked before every pop, so a batch overruns it by at
    /// most the cost of one item.
    pub fn drain_batch(&self) -> BatchStats {
        let start = self.clock.now();
        let mut drained = 0;
        loop {
            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed >= self.budget {
                return BatchStats {
                    drained,
                    elapsed,
                    remaining: self.len(),
                };
            }
            // Pop under the lock, deliver outside it.
            let next = self.queue.lock().pop_front();
            match next {
                Some(item) => {
                    let event = RouteEvent::from(item);
                    self.consumer.on_event(&event);
                    drained += 1;
                }
                None => {
                    return BatchStats {
                        drained,
                        elapsed,
                        remaining: 0,
                    }
                }
            }
        }
    }

    /// Force overdue slots into a timeout error. Skipped while the
    /// watchdogs are deferring, so both give up on a route under the same
    /// visibility policy.
    pub fn sweep(&self) -> usize {
        if self.watchdogs.is_deferring() {
            return 0;
        }

        let mut forced = 0;
        let now = Instant::now();
        for slot in self.slots.overdue(now, self.sweep_grace) {
            if slot.is_queued() {
                continue;
            }
            let status = match slot.status() {
                RouteStatus::Fallback => RouteStatus::FallbackError,
                _ => RouteStatus::Error,
            };
            let waited = slot.waited(now).unwrap_or(self.sweep_grace);
            if !slot.finalize(status) {
                continue;
            }

            let key = slot.key();
            self.watchdogs
                .cancel_all([key.primary_watchdog(), key.fallback_watchdog()]);

            let route = slot.route();
            let err = ScanError::Timeout {
                provider: route.provider.clone(),
                after_ms: waited.as_millis() as u64,
            };
            warn!(
                key = %key,
                %status,
                waited_ms = waited.as_millis() as u64,
                "Safety sweep finalized overdue route"
            );
            self.push(QueueItem::Rejected(RouteError::for_route(route, status, &err)));
            forced += 1;
        }

        self.swept.fetch_add(forced as u64, Ordering::Relaxed);
        forced
    }

    /// Cooperative drain loop. Returns once [`finish`](Self::finish) was
    /// called and the queue is empty.
    pub async fn run(self: Arc<Self>, frame_interval: Duration, background_interval: Duration) -> DrainStats {
        let mut stats = DrainStats::default();
        loop {
            let batch = self.drain_batch();
            stats.record(&batch);
            if batch.remaining > 0 {
                debug!(
                    drained = batch.drained,
                    remaining = batch.remaining,
                    "Drain budget spent, yielding"
                );
            }

            self.sweep();

            if self.finished.load(Ordering::Acquire) && self.is_empty() {
                break;
            }

            let pace = if self.visibility.should_defer() {
                background_interval
            } else {
                frame_interval
            };
            tokio::time::sleep(pace).await;
        }
        stats.swept = self.swept_count();
        stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::watchdog::{AlwaysVisible, VisibilityFlag};
    use crate::types::{Direction, Route, RouteKey};
    use std::sync::atomic::AtomicUsize;

    /// Counts events and charges the manual clock per delivered item.
    struct CostlyConsumer {
        clock: Arc<ManualClock>,
        cost: Duration,
        seen: AtomicUsize,
        statuses: Mutex<Vec<RouteStatus>>,
    }

    impl CostlyConsumer {
        fn new(clock: Arc<ManualClock>, cost: Duration) -> Self {
            Self {
                clock,
                cost,
                seen: AtomicUsize::new(0),
                statuses: Mutex::new(Vec::new()),
            }
        }
    }

    impl RouteEventConsumer for CostlyConsumer {
        fn on_event(&self, event: &RouteEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.statuses.lock().push(event.status);
            self.clock.advance(self.cost);
        }
    }

    fn interim(i: usize) -> QueueItem {
        QueueItem::Interim {
            key: RouteKey::new(&format!("T{i}"), "binance", "1inch", Direction::Forward),
            status: RouteStatus::Checking,
        }
    }

    fn route(provider: &str) -> Route {
        Route {
            token_id: "PEPE".to_string(),
            venue: "binance".to_string(),
            provider: provider.to_string(),
            direction: Direction::Forward,
            amount: 100.0,
        }
    }

    fn sink_with(
        consumer: Arc<dyn RouteEventConsumer>,
        clock: Arc<dyn Clock>,
        visibility: Arc<dyn Visibility>,
        slots: Arc<SlotTable>,
    ) -> Arc<ResultSink> {
        sink_deferring(consumer, clock, visibility, slots, true)
    }

    fn sink_deferring(
        consumer: Arc<dyn RouteEventConsumer>,
        clock: Arc<dyn Clock>,
        visibility: Arc<dyn Visibility>,
        slots: Arc<SlotTable>,
        defer_when_hidden: bool,
    ) -> Arc<ResultSink> {
        let watchdogs = WatchdogManager::new(
            Arc::clone(&visibility),
            defer_when_hidden,
            Duration::from_millis(100),
        );
        Arc::new(ResultSink::new(
            slots,
            watchdogs,
            consumer,
            clock,
            visibility,
            Duration::from_millis(12),
            Duration::from_millis(500),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_respects_batch_budget() {
        let clock = Arc::new(ManualClock::new());
        let consumer = Arc::new(CostlyConsumer::new(clock.clone(), Duration::from_millis(1)));
        let sink = sink_with(
            consumer.clone(),
            clock.clone(),
            Arc::new(AlwaysVisible),
            Arc::new(SlotTable::new()),
        );

        for i in 0..10_000 {
            sink.push(interim(i));
        }

        let mut batches = Vec::new();
        while !sink.is_empty() {
            batches.push(sink.drain_batch());
        }

        assert!(batches.len() > 1);
        assert!(batches.iter().all(|b| b.elapsed <= Duration::from_millis(12)));
        assert!(batches.iter().all(|b| b.drained <= 12));
        assert_eq!(batches.iter().map(|b| b.drained).sum::<usize>(), 10_000);
        assert_eq!(batches.len(), 834); // ceil(10_000 / 12)
        assert_eq!(consumer.seen.load(Ordering::SeqCst), 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let clock = Arc::new(ManualClock::new());
        let consumer = Arc::new(CostlyConsumer::new(clock.clone(), Duration::ZERO));
        let sink = sink_with(
            consumer.clone(),
            clock,
            Arc::new(AlwaysVisible),
            Arc::new(SlotTable::new()),
        );

        sink.push(QueueItem::Interim {
            key: RouteKey::new("A", "binance", "1inch", Direction::Forward),
            status: RouteStatus::Checking,
        });
        sink.push(QueueItem::Interim {
            key: RouteKey::new("A", "binance", "1inch", Direction::Forward),
            status: RouteStatus::Fallback,
        });
        let batch = sink.drain_batch();
        assert_eq!(batch.drained, 2);
        assert_eq!(
            *consumer.statuses.lock(),
            vec![RouteStatus::Checking, RouteStatus::Fallback]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exits_only_when_finished_and_empty() {
        let consumer = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::new()), Duration::ZERO));
        let sink = sink_with(
            consumer.clone(),
            Arc::new(SystemClock),
            Arc::new(AlwaysVisible),
            Arc::new(SlotTable::new()),
        );

        let task = tokio::spawn(
            Arc::clone(&sink).run(Duration::from_millis(16), Duration::from_millis(250)),
        );

        sink.push(interim(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());

        sink.push(interim(2));
        sink.finish();
        let stats = task.await.unwrap();
        assert_eq!(stats.items, 2);
        assert_eq!(consumer.seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_finalizes_overdue_slot() {
        let slots = Arc::new(SlotTable::new());
        let consumer = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::new()), Duration::ZERO));
        let sink = sink_with(
            consumer.clone(),
            Arc::new(SystemClock),
            Arc::new(AlwaysVisible),
            slots.clone(),
        );

        let slot = slots.open(&route("1inch")).unwrap();
        slot.begin_check(Instant::now() + Duration::from_millis(100));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(sink.sweep(), 0); // inside grace

        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(sink.sweep(), 1);
        assert!(slot.is_final());
        assert_eq!(slot.status(), RouteStatus::Error);
        // Reports how long the route was outstanding, not the grace.
        match sink.queue.lock().front() {
            Some(QueueItem::Rejected(err)) => {
                assert!(err.message.ends_with("within 700ms"), "{}", err.message)
            }
            other => panic!("expected a rejected item, got {other:?}"),
        }

        // Already final: the sweep never touches it again.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(sink.sweep(), 0);

        sink.drain_batch();
        assert_eq!(*consumer.statuses.lock(), vec![RouteStatus::Error]);
        assert_eq!(sink.swept_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_queued_and_hidden() {
        let slots = Arc::new(SlotTable::new());
        let flag = Arc::new(VisibilityFlag::new());
        let consumer = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::new()), Duration::ZERO));
        let sink = sink_with(consumer, Arc::new(SystemClock), flag.clone(), slots.clone());

        let queued = slots.open(&route("1inch")).unwrap();
        queued.begin_check(Instant::now());
        queued.mark_queued();

        let hidden = slots.open(&route("paraswap")).unwrap();
        hidden.begin_check(Instant::now());

        tokio::time::advance(Duration::from_secs(2)).await;
        flag.set_hidden(true);
        assert_eq!(sink.sweep(), 0);

        flag.set_hidden(false);
        assert_eq!(sink.sweep(), 1);
        assert!(!queued.is_final());
        assert!(hidden.is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_ignores_hidden_when_deferral_disabled() {
        let slots = Arc::new(SlotTable::new());
        let flag = Arc::new(VisibilityFlag::new());
        let consumer = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::new()), Duration::ZERO));
        let sink = sink_deferring(consumer, Arc::new(SystemClock), flag.clone(), slots.clone(), false);

        let slot = slots.open(&route("1inch")).unwrap();
        slot.begin_check(Instant::now());

        tokio::time::advance(Duration::from_secs(2)).await;
        flag.set_hidden(true);
        assert_eq!(sink.sweep(), 1);
        assert!(slot.is_final());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_in_fallback_yields_fallback_error() {
        let slots = Arc::new(SlotTable::new());
        let consumer = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::new()), Duration::ZERO));
        let sink = sink_with(consumer, Arc::new(SystemClock), Arc::new(AlwaysVisible), slots.clone());

        let slot = slots.open(&route("1inch")).unwrap();
        slot.begin_check(Instant::now());
        slot.enter_fallback(Instant::now());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(sink.sweep(), 1);
        assert_eq!(slot.status(), RouteStatus::FallbackError);
    }

    #[test]
    fn test_fanout_forwards_to_all() {
        let a = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::default()), Duration::ZERO));
        let b = Arc::new(CostlyConsumer::new(Arc::new(ManualClock::default()), Duration::ZERO));
        let fanout = Fanout::new().with(a.clone()).with(b.clone());

        fanout.on_event(&RouteEvent::from(interim(1)));
        assert_eq!(a.seen.load(Ordering::SeqCst), 1);
        assert_eq!(b.seen.load(Ordering::SeqCst), 1);
    }
}
