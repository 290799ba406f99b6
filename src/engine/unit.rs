//! Quote request unit: one (route, direction, provider) attempt.
//!
//! readiness check → paced primary dispatch raced against its
//! watchdog → optional fallback dispatch raced against its own watchdog.
//! Every terminal transition goes through [`RouteSlot::finalize`], so a
//! straggling response or a late watchdog can never produce a second
//! terminal item for the same route.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::slots::RouteSlot;
use super::RunContext;
use crate::pnl;
use crate::types::{
    ChainId, Direction, Quote, QueueItem, QuoteRequest, ReferencePriceSnapshot, Route, RouteError,
    RouteResult, RouteStatus, ScanError, Token,
};

/// Human units → base units. Saturates on overflow, zero for non-finite input.
pub fn to_raw(amount: f64, decimals: u8) -> u128 {
    if !amount.is_finite() || amount <= 0.0 {
        return 0;
    }
    (amount * 10f64.powi(decimals as i32)).floor() as u128
}

/// Pre-flight validation. Never touches the network.
pub fn readiness(
    token: &Token,
    route: &Route,
    snapshot: &ReferencePriceSnapshot,
    provider_registered: bool,
) -> Result<QuoteRequest, ScanError> {
    if !route.amount.is_finite() || route.amount <= 0.0 {
        return Err(ScanError::ReadinessRejected(format!(
            "trade amount must be > 0 (got {})",
            route.amount
        )));
    }

    let chain: ChainId = token
        .chain
        .parse()
        .map_err(|_| ScanError::ReadinessRejected(format!("unknown chain '{}'", token.chain)))?;

    for leg in [&token.left, &token.right] {
        if !chain.is_valid_address(&leg.contract) {
            return Err(ScanError::ReadinessRejected(format!(
                "invalid {} contract address '{}' for {chain}",
                leg.symbol, leg.contract
            )));
        }
    }

    if !provider_registered {
        return Err(ScanError::ReadinessRejected(format!(
            "no quote source registered for provider '{}'",
            route.provider
        )));
    }

    let (token_in, token_out) = match route.direction {
        Direction::Forward => (&token.left, &token.right),
        Direction::Reverse => (&token.right, &token.left),
    };
    let amount_in = route.amount / snapshot.entry_price(route.direction);
    let amount_in_raw = to_raw(amount_in, token_in.decimals);
    if amount_in_raw == 0 {
        return Err(ScanError::ReadinessRejected(format!(
            "computed input quantity of {} is zero",
            token_in.symbol
        )));
    }

    Ok(QuoteRequest {
        key: route.key(),
        provider: route.provider.clone(),
        direction: route.direction,
        chain,
        token_in: token_in.clone(),
        token_out: token_out.clone(),
        amount_in,
        amount_in_raw,
    })
}

/// Drive one route to its terminal state.
pub(crate) async fn execute(
    run: Arc<RunContext>,
    token: Arc<Token>,
    route: Route,
    snapshot: ReferencePriceSnapshot,
) {
    let Some(slot) = run.slots.open(&route) else {
        debug!(route = %route, "Live slot already exists, skipping duplicate route");
        return;
    };
    let key = slot.key().clone();

    drive(&run, &token, &slot, &route, snapshot).await;

    run.watchdogs
        .cancel_all([key.primary_watchdog(), key.fallback_watchdog()]);
}

async fn drive(
    run: &Arc<RunContext>,
    token: &Token,
    slot: &RouteSlot,
    route: &Route,
    snapshot: ReferencePriceSnapshot,
) {
    let key = slot.key();

    // Pending → Failed
    let request = match readiness(token, route, &snapshot, run.sources.has_quote(&route.provider)) {
        Ok(request) => request,
        Err(err) => {
            finish_error(run, slot, route, RouteStatus::Failed, err);
            return;
        }
    };

    if run.cancel.is_cancelled() {
        run.slots.abandon(key);
        return;
    }

    // Pending → Checking
    let policy = run.settings.policy(&route.provider);
    let at = run.pacer.reserve(&route.provider, run.limiter.delay(&route.provider));
    slot.begin_check(at + policy.dispatch_timeout);
    run.interim(slot, RouteStatus::Checking);
    debug!(
        key = %key,
        wait_ms = at.saturating_duration_since(Instant::now()).as_millis() as u64,
        "Dispatch scheduled"
    );

    tokio::time::sleep_until(at).await;
    if run.cancel.is_cancelled() {
        run.slots.abandon(key);
        return;
    }

    let primary = attempt(
        run,
        &request,
        &route.provider,
        key.primary_watchdog(),
        policy.dispatch_timeout,
    )
    .await;

    if run.cancel.is_cancelled() {
        drop_after_cancel(run, slot);
        return;
    }

    let primary_err = match primary {
        Ok(quote) => {
            finish_success(run, slot, route, quote, None, snapshot);
            return;
        }
        Err(err) => err,
    };

    let fallback = policy
        .fallback_provider
        .filter(|provider| run.sources.has_quote(provider));
    let Some(fallback) = fallback else {
        finish_error(run, slot, route, RouteStatus::Error, primary_err);
        return;
    };

    // Checking → Fallback
    let fb_at = run.pacer.reserve(&fallback, run.limiter.delay(&fallback));
    if !slot.enter_fallback(fb_at + policy.fallback_timeout) {
        // The safety sweep got there first.
        run.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    run.interim(slot, RouteStatus::Fallback);
    debug!(key = %key, fallback = %fallback, reason = %primary_err, "Entering fallback");

    tokio::time::sleep_until(fb_at).await;
    if run.cancel.is_cancelled() {
        drop_after_cancel(run, slot);
        return;
    }

    let mut fb_request = request.clone();
    fb_request.provider = fallback.clone();
    let secondary = attempt(
        run,
        &fb_request,
        &fallback,
        key.fallback_watchdog(),
        policy.fallback_timeout,
    )
    .await;

    if run.cancel.is_cancelled() {
        drop_after_cancel(run, slot);
        return;
    }

    match secondary {
        Ok(quote) => finish_success(run, slot, route, quote, Some(fallback), snapshot),
        Err(fb_err) => {
            let err = ScanError::FallbackExhausted {
                provider: route.provider.clone(),
                fallback,
                cause: fb_err.kind(),
                message: format!("primary: {primary_err}; fallback: {fb_err}"),
            };
            finish_error(run, slot, route, RouteStatus::FallbackError, err);
        }
    }
}

/// One network attempt raced against a watchdog.
///
/// The call runs in its own task so a panicking adapter is contained and a
/// timed-out call can keep running in the background; its eventual result
/// is counted and dropped.
async fn attempt(
    run: &Arc<RunContext>,
    request: &QuoteRequest,
    provider: &str,
    watchdog_key: String,
    window: Duration,
) -> Result<Quote, ScanError> {
    let source = run.sources.quote(provider).ok_or_else(|| ScanError::UpstreamFailure {
        provider: provider.to_string(),
        message: "no quote source registered".to_string(),
    })?;

    let (fire_tx, fire_rx) = oneshot::channel::<()>();
    run.watchdogs.arm(
        watchdog_key.clone(),
        window,
        Box::new(move || {
            let _ = fire_tx.send(());
        }),
    );

    let guard = run.inflight.enter();
    let call_request = request.clone();
    let mut call = tokio::spawn(async move {
        let _guard = guard;
        source.fetch_quote(&call_request).await
    });

    tokio::select! {
        joined = &mut call => {
            run.watchdogs.cancel(&watchdog_key);
            match joined {
                Ok(Ok(quote)) if quote.is_valid() => Ok(quote),
                Ok(Ok(quote)) => Err(ScanError::UpstreamFailure {
                    provider: provider.to_string(),
                    message: format!("invalid quote amount {}", quote.amount_out),
                }),
                Ok(Err(e)) => Err(ScanError::UpstreamFailure {
                    provider: provider.to_string(),
                    message: format!("{e:#}"),
                }),
                Err(join_err) => Err(ScanError::UpstreamFailure {
                    provider: provider.to_string(),
                    message: format!("quote task failed: {join_err}"),
                }),
            }
        }
        // Fired, or aborted by the safety sweep / end of run.
        _ = fire_rx => {
            let straggler = Arc::clone(run);
            let key = request.key.clone();
            tokio::spawn(async move {
                if let Ok(Ok(_)) = call.await {
                    straggler.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "Late response after watchdog dropped");
                }
            });
            Err(ScanError::Timeout {
                provider: provider.to_string(),
                after_ms: window.as_millis() as u64,
            })
        }
    }
}

fn finish_success(
    run: &RunContext,
    slot: &RouteSlot,
    route: &Route,
    quote: Quote,
    fallback_provider: Option<String>,
    snapshot: ReferencePriceSnapshot,
) {
    if !slot.finalize(RouteStatus::Success) {
        run.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
        debug!(key = %slot.key(), "Result arrived after finalization, dropped");
        return;
    }

    let counter = if fallback_provider.is_some() {
        &run.stats.fallback_success
    } else {
        &run.stats.success
    };
    counter.fetch_add(1, Ordering::Relaxed);

    let economics = pnl::estimate(route, &snapshot, &quote);
    debug!(
        key = %slot.key(),
        amount_out = quote.amount_out,
        fallback = fallback_provider.as_deref().unwrap_or("-"),
        pnl_bps = economics.pnl_bps,
        "Route resolved"
    );

    run.sink.push(QueueItem::Resolved(RouteResult {
        key: slot.key().clone(),
        route: route.clone(),
        quote,
        fallback_provider,
        snapshot,
        economics,
    }));
}

fn finish_error(
    run: &RunContext,
    slot: &RouteSlot,
    route: &Route,
    status: RouteStatus,
    err: ScanError,
) {
    if !slot.finalize(status) {
        run.stats.late_dropped.fetch_add(1, Ordering::Relaxed);
        debug!(key = %slot.key(), "Error arrived after finalization, dropped");
        return;
    }

    let counter = match status {
        RouteStatus::Failed => &run.stats.failed,
        RouteStatus::FallbackError => &run.stats.fallback_error,
        _ => &run.stats.error,
    };
    counter.fetch_add(1, Ordering::Relaxed);

    warn!(route = %route, %status, kind = %err.kind(), "{err}");
    run.sink
        .push(QueueItem::Rejected(RouteError::for_route(route, status, &err)));
}

fn drop_after_cancel(run: &RunContext, slot: &RouteSlot) {
    run.stats.dropped_after_cancel.fetch_add(1, Ordering::Relaxed);
    run.slots.abandon(slot.key());
    debug!(key = %slot.key(), "Scan cancelled, result dropped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
