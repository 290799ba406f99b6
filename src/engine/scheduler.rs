//! Scan scheduler.
//!
//! Tokens are split into fixed-size groups. Groups run strictly one after
//! another with `inter_group_delay` between them; tokens inside a group run
//! concurrently, optionally staggered by `index × inter_token_delay`.
//! A group is done once its tokens have dispatched their units; network
//! tails of one group may still be in flight while the next one starts.

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::pipeline::{self, TokenOutcome};
use super::sink::RouteEventConsumer;
use super::RunContext;
use crate::config::ScheduleMode;
use crate::types::{duration_ms, ScanProgress, Token};

/// Timing of one group, as offsets from the start of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupTiming {
    pub index: usize,
    pub tokens: usize,
    #[serde(with = "duration_ms")]
    pub started: Duration,
    #[serde(with = "duration_ms")]
    pub finished: Duration,
}

/// Counts settled tokens and publishes progress.
pub(crate) struct ProgressTracker {
    total: usize,
    completed: AtomicUsize,
    started: Instant,
    tx: Arc<watch::Sender<ScanProgress>>,
    consumer: Arc<dyn RouteEventConsumer>,
    // Serializes publish so the watch value never goes backwards.
    publish: Mutex<()>,
}

impl ProgressTracker {
    pub(crate) fn new(
        total: usize,
        started: Instant,
        tx: Arc<watch::Sender<ScanProgress>>,
        consumer: Arc<dyn RouteEventConsumer>,
    ) -> Self {
        let tracker = Self {
            total,
            completed: AtomicUsize::new(0),
            started,
            tx,
            consumer,
            publish: Mutex::new(()),
        };
        tracker.tx.send_replace(ScanProgress {
            total,
            ..Default::default()
        });
        tracker
    }

    pub(crate) fn settle(&self, label: String) {
        let _publish = self.publish.lock();
        let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        let progress = ScanProgress {
            completed,
            total: self.total,
            elapsed: self.started.elapsed(),
            current_label: label,
        };
        self.consumer.on_progress(&progress);
        self.tx.send_replace(progress);
    }

    #[cfg(test)]
    pub(crate) fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}

/// Run every group. Returns the timing of each group that started.
pub(crate) async fn run_groups(
    run: &Arc<RunContext>,
    tokens: Vec<Arc<Token>>,
    progress: &ProgressTracker,
) -> Vec<GroupTiming> {
    let group_size = run.settings.group_size.max(1);
    let group_count = tokens.len().div_ceil(group_size);
    let mut timings = Vec::with_capacity(group_count);

    for (index, group) in tokens.chunks(group_size).enumerate() {
        if index > 0 {
            tokio::time::sleep(run.settings.inter_group_delay).await;
        }
        if run.cancel.is_cancelled() {
            info!(group = index + 1, groups = group_count, "Scan cancelled, not starting group");
            break;
        }

        let started = progress.started.elapsed();
        info!(
            group = index + 1,
            groups = group_count,
            tokens = group.len(),
            "Starting group"
        );

        let units = group
            .iter()
            .enumerate()
            .map(|(i, token)| run_token(run, Arc::clone(token), i, progress));
        join_all(units).await;

        let finished = progress.started.elapsed();
        debug!(
            group = index + 1,
            elapsed_ms = (finished - started).as_millis() as u64,
            "Group settled"
        );
        timings.push(GroupTiming {
            index,
            tokens: group.len(),
            started,
            finished,
        });
    }

    timings
}

async fn run_token(run: &Arc<RunContext>, token: Arc<Token>, index: usize, progress: &ProgressTracker) {
    if run.settings.schedule == ScheduleMode::Staggered && index > 0 {
        let stagger = run.settings.inter_token_delay * index as u32;
        tokio::time::sleep(stagger).await;
    }
    if run.cancel.is_cancelled() {
        return;
    }
    if !run.book.contains(&token.id) {
        debug!(token = %token.id, "Token no longer in book, skipping");
        run.stats.tokens_skipped.fetch_add(1, Ordering::Relaxed);
        progress.settle(token.label());
        return;
    }

    match pipeline::process(run, Arc::clone(&token)).await {
        TokenOutcome::Cancelled => return,
        TokenOutcome::Skipped => {
            run.stats.tokens_skipped.fetch_add(1, Ordering::Relaxed);
        }
        TokenOutcome::Quoted { .. } | TokenOutcome::ReferenceUnavailable => {
            run.stats.tokens_processed.fetch_add(1, Ordering::Relaxed);
        }
    }
    progress.settle(token.label());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
