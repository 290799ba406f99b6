//! Per-token pipeline.
//!
//! Fetch the reference snapshot with bounded retry, then dispatch one quote
//! request unit per allowed route as its own task. The pipeline returns once
//! the units are dispatched and the inter-token delay has passed; the units
//! settle on their own and the run waits for them at the end.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{unit, RunContext};
use crate::types::{QueueItem, ReferencePriceSnapshot, RouteError, ScanError, Token};

/// How a token left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOutcome {
    /// Units were dispatched (possibly zero after allow-list filtering).
    Quoted { routes: usize },
    ReferenceUnavailable,
    /// Removed from the live token set mid-flight.
    Skipped,
    Cancelled,
}

enum ReferenceFetch {
    Ready(ReferencePriceSnapshot),
    Unavailable(ScanError),
    Cancelled,
}

pub(crate) async fn process(run: &Arc<RunContext>, token: Arc<Token>) -> TokenOutcome {
    let snapshot = match fetch_reference(run, &token).await {
        ReferenceFetch::Ready(snapshot) => snapshot,
        ReferenceFetch::Cancelled => return TokenOutcome::Cancelled,
        ReferenceFetch::Unavailable(err) => {
            run.stats.reference_unavailable.fetch_add(1, Ordering::Relaxed);
            warn!(token = %token.id, "{err}");
            run.sink
                .push(QueueItem::Rejected(RouteError::for_token(&token.id, &err)));
            return TokenOutcome::ReferenceUnavailable;
        }
    };

    if run.cancel.is_cancelled() {
        return TokenOutcome::Cancelled;
    }
    if !run.book.contains(&token.id) {
        debug!(token = %token.id, "Token removed during reference fetch, skipping");
        return TokenOutcome::Skipped;
    }

    let routes = token.routes_for(&run.settings.active_providers);
    let count = routes.len();
    debug!(token = %token.id, routes = count, %snapshot, "Dispatching routes");

    for route in routes {
        let guard = run.units.enter();
        let unit = unit::execute(Arc::clone(run), Arc::clone(&token), route, snapshot);
        tokio::spawn(async move {
            let _guard = guard;
            unit.await;
        });
    }

    tokio::time::sleep(run.settings.inter_token_delay).await;
    TokenOutcome::Quoted { routes: count }
}

/// Up to `reference_attempts` tries, `reference_retry_delay` apart, each
/// bounded by `reference_timeout`. A try that returns a snapshot with any
/// non-finite or non-positive price counts as a failure.
async fn fetch_reference(run: &RunContext, token: &Token) -> ReferenceFetch {
    let source = run.sources.reference();
    let attempts = run.settings.reference_attempts;
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(run.settings.reference_retry_delay).await;
        }
        if run.cancel.is_cancelled() {
            return ReferenceFetch::Cancelled;
        }

        let outcome =
            tokio::time::timeout(run.settings.reference_timeout, source.fetch_reference_price(token))
                .await;
        match outcome {
            Ok(Ok(snapshot)) if snapshot.is_valid() => {
                if attempt > 1 {
                    info!(token = %token.id, attempt, "Reference price recovered");
                }
                return ReferenceFetch::Ready(snapshot);
            }
            Ok(Ok(snapshot)) => last_error = format!("invalid snapshot ({snapshot})"),
            Ok(Err(e)) => last_error = format!("{e:#}"),
            Err(_) => {
                last_error = format!(
                    "timed out after {}ms",
                    run.settings.reference_timeout.as_millis()
                )
            }
        }
        debug!(token = %token.id, attempt, attempts, error = %last_error, "Reference fetch failed");
    }

    ReferenceFetch::Unavailable(ScanError::ReferenceUnavailable {
        attempts,
        message: last_error,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
