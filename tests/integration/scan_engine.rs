//! End-to-end scan passes on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use routescan::engine::{CancelFlag, ScanEngine, TokenBook};
use routescan::types::*;

use crate::mock_sources::*;

fn engine(
    settings: routescan::config::ScanSettings,
    sources: routescan::sources::Sources,
    tokens: &[Token],
    consumer: &Arc<RecordingConsumer>,
) -> ScanEngine {
    ScanEngine::new(
        settings,
        sources,
        TokenBook::new(tokens.to_vec()),
        consumer.clone(),
    )
}

fn key(token: &str, provider: &str) -> RouteKey {
    RouteKey::new(token, "binance", provider, Direction::Forward)
}

// ---------------------------------------------------------------------------
// Fallback and timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_fallback_success_and_primary_timeout() {
    let reference = ScriptedReference::flat();
    let p1 = ScriptedQuote::fail(500, "HTTP 502 from p1");
    let p1b = ScriptedQuote::respond(400, 510.0);
    let p2 = ScriptedQuote::hang();

    let mut settings = fast_settings();
    settings.providers.insert("p1".into(), provider(2_000, Some("p1b")));
    settings.providers.insert("p2".into(), provider(1_000, None));

    let t = token("T", &[("p1", Direction::Forward), ("p2", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(
            reference.clone(),
            &[("p1", p1.clone()), ("p1b", p1b.clone()), ("p2", p2.clone())],
        ),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    let terminal = consumer.terminal_events();
    assert_eq!(terminal.len(), 2);

    let (at, fallback) = terminal
        .iter()
        .find(|(_, e)| e.key.as_ref() == Some(&key("T", "p1")))
        .unwrap();
    assert_eq!(fallback.status, RouteStatus::Success);
    let result = fallback.result.as_ref().unwrap();
    assert_eq!(result.fallback_provider.as_deref(), Some("p1b"));
    assert_eq!(result.answered_by(), "p1b");
    assert!(*at >= Duration::from_millis(900) && *at < Duration::from_millis(1_000));

    let (at, timeout) = terminal
        .iter()
        .find(|(_, e)| e.key.as_ref() == Some(&key("T", "p2")))
        .unwrap();
    assert_eq!(timeout.status, RouteStatus::Error);
    assert_eq!(timeout.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    // 1000ms provider timeout + 250ms safety margin.
    assert!(*at >= Duration::from_millis(1_250) && *at < Duration::from_millis(1_350));

    assert_eq!(reference.calls(), 1);
    assert_eq!((p1.calls(), p1b.calls(), p2.calls()), (1, 1, 1));

    assert_eq!(report.outcomes.fallback_success, 1);
    assert_eq!(report.outcomes.error, 1);
    assert_eq!(report.outcomes.terminal(), 2);
    assert_eq!(consumer.report_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_disabled_provider_never_falls_back() {
    let p1 = ScriptedQuote::fail(200, "HTTP 500");
    let p1b = ScriptedQuote::respond(100, 510.0);

    let mut settings = fast_settings();
    let mut policy = provider(2_000, Some("p1b"));
    policy.fallback = false;
    settings.providers.insert("p1".into(), policy);

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", p1.clone()), ("p1b", p1b.clone())]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    assert_eq!(p1b.calls(), 0);
    let terminal = consumer.terminal_events();
    assert_eq!(terminal.len(), 1);
    let error = terminal[0].1.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::UpstreamFailure);
    assert_eq!(error.status, RouteStatus::Error);
    assert_eq!(report.outcomes.error, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_exhausted() {
    let p1 = ScriptedQuote::fail(100, "HTTP 500");
    let p1b = ScriptedQuote::fail(100, "HTTP 429");

    let mut settings = fast_settings();
    settings.providers.insert("p1".into(), provider(2_000, Some("p1b")));

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", p1), ("p1b", p1b)]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    let terminal = consumer.terminal_events();
    assert_eq!(terminal.len(), 1);
    let error = terminal[0].1.error.as_ref().unwrap();
    assert_eq!(error.status, RouteStatus::FallbackError);
    assert_eq!(error.kind, ErrorKind::FallbackExhausted);
    assert_eq!(error.cause, Some(ErrorKind::UpstreamFailure));
    assert!(error.message.contains("HTTP 500"));
    assert!(error.message.contains("HTTP 429"));
    assert_eq!(report.outcomes.fallback_error, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_timeout_is_tagged_as_timeout() {
    let p1 = ScriptedQuote::fail(100, "HTTP 500");
    let p1b = ScriptedQuote::hang();

    let mut settings = fast_settings();
    settings.providers.insert("p1".into(), provider(2_000, Some("p1b")));

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", p1), ("p1b", p1b.clone())]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    assert_eq!(p1b.calls(), 1);
    let terminal = consumer.terminal_events();
    assert_eq!(terminal.len(), 1);
    let (at, event) = &terminal[0];
    let error = event.error.as_ref().unwrap();
    assert_eq!(error.status, RouteStatus::FallbackError);
    assert_eq!(error.kind, ErrorKind::FallbackExhausted);
    assert_eq!(error.cause, Some(ErrorKind::Timeout));
    // 100ms primary failure + 1000ms fallback window.
    assert!(*at >= Duration::from_millis(1_100) && *at < Duration::from_millis(1_200));
    assert_eq!(report.outcomes.fallback_error, 1);
}

#[tokio::test(start_paused = true)]
async fn test_interim_transitions_in_order() {
    let mut settings = fast_settings();
    settings.surface_interim = true;
    settings.providers.insert("p1".into(), provider(2_000, Some("p1b")));

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(
            ScriptedReference::flat(),
            &[
                ("p1", ScriptedQuote::fail(100, "HTTP 500")),
                ("p1b", ScriptedQuote::respond(100, 505.0)),
            ],
        ),
        &[t.clone()],
        &consumer,
    );

    engine.run(vec![t], CancelFlag::new()).await;

    let statuses: Vec<RouteStatus> = consumer
        .events()
        .into_iter()
        .filter(|(_, e)| e.key.as_ref() == Some(&key("T", "p1")))
        .map(|(_, e)| e.status)
        .collect();
    assert_eq!(
        statuses,
        vec![RouteStatus::Checking, RouteStatus::Fallback, RouteStatus::Success]
    );
}

// ---------------------------------------------------------------------------
// Finalize-once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_response_racing_watchdog_finalizes_once() {
    // The response lands on the same tick the watchdog fires.
    let p1 = ScriptedQuote::respond(1_250, 500.0);
    let mut settings = fast_settings();
    settings.providers.insert("p1".into(), provider(1_000, None));

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", p1)]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    assert_eq!(consumer.terminal_events().len(), 1);
    assert_eq!(report.outcomes.success + report.outcomes.error, 1);
    assert_eq!(report.outcomes.terminal(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_route_dispatched_once() {
    let p1 = ScriptedQuote::respond(100, 500.0);
    let t = token("T", &[("p1", Direction::Forward), ("P1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        fast_settings(),
        sources(ScriptedReference::flat(), &[("p1", p1.clone())]),
        &[t.clone()],
        &consumer,
    );

    engine.run(vec![t], CancelFlag::new()).await;

    assert_eq!(p1.calls(), 1);
    assert_eq!(consumer.terminal_events().len(), 1);
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_groups_run_strictly_in_sequence() {
    let mut settings = fast_settings();
    settings.group_size = 2;
    settings.inter_group_delay = Duration::from_millis(1_000);

    let tokens: Vec<Token> = ["A", "B", "C", "D", "E"]
        .iter()
        .map(|id| token(id, &[("p1", Direction::Forward)]))
        .collect();
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", ScriptedQuote::respond(100, 500.0))]),
        &tokens,
        &consumer,
    );

    let report = engine.run(tokens, CancelFlag::new()).await;

    assert_eq!(report.groups.len(), 3);
    for pair in report.groups.windows(2) {
        assert!(pair[1].started >= pair[0].finished + Duration::from_millis(1_000));
    }
    // Last group starts at 2000ms and its route answers 100ms later.
    assert!(report.elapsed >= Duration::from_millis(2_100));
    assert_eq!(report.outcomes.success, 5);

    let progress = consumer.progress();
    assert_eq!(progress.len(), 5);
    assert!(progress.windows(2).all(|p| p[0].completed < p[1].completed));
    assert_eq!(progress.last().unwrap().completed, 5);
    assert_eq!(progress.last().unwrap().total, 5);
}

#[tokio::test(start_paused = true)]
async fn test_next_group_starts_while_previous_routes_in_flight() {
    let mut settings = fast_settings();
    settings.group_size = 1;
    settings.inter_group_delay = Duration::from_millis(100);
    settings.providers.insert("p1".into(), provider(2_000, None));

    let tokens = vec![
        token("A", &[("p1", Direction::Forward)]),
        token("B", &[("p1", Direction::Forward)]),
    ];
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", ScriptedQuote::hang())]),
        &tokens,
        &consumer,
    );

    let report = engine.run(tokens, CancelFlag::new()).await;

    assert_eq!(report.groups.len(), 2);
    // Held only by the inter-group delay, not by A's 2250ms window.
    let second = report.groups[1].started;
    assert!(second >= Duration::from_millis(100) && second < Duration::from_millis(200));

    let terminal = consumer.terminal_events();
    assert_eq!(terminal.len(), 2);
    let (a_at, a) = terminal
        .iter()
        .find(|(_, e)| e.key.as_ref() == Some(&key("A", "p1")))
        .unwrap();
    assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::Timeout);
    assert!(*a_at >= Duration::from_millis(2_250));
    assert!(*a_at > second);
    assert_eq!(report.outcomes.error, 2);
}

#[tokio::test(start_paused = true)]
async fn test_same_provider_dispatches_are_spaced() {
    let p1 = ScriptedQuote::respond(50, 500.0);
    let mut settings = fast_settings();
    settings.group_size = 3;
    settings.rate_delays.insert("p1".into(), Duration::from_millis(500));

    let tokens: Vec<Token> = ["A", "B", "C"]
        .iter()
        .map(|id| token(id, &[("p1", Direction::Forward), ("p1", Direction::Reverse)]))
        .collect();
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(ScriptedReference::flat(), &[("p1", p1.clone())]),
        &tokens,
        &consumer,
    );

    let report = engine.run(tokens, CancelFlag::new()).await;

    assert_eq!(report.outcomes.success, 6);
    let mut times = p1.dispatch_times();
    times.sort();
    assert_eq!(times.len(), 6);
    assert_eq!(times[0], Duration::ZERO);
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_tokens_scanned_once() {
    let reference = ScriptedReference::flat();
    let p1 = ScriptedQuote::respond(100, 500.0);
    let t = token("A", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        fast_settings(),
        sources(reference.clone(), &[("p1", p1.clone())]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t.clone(), t], CancelFlag::new()).await;

    assert_eq!(report.tokens_total, 1);
    assert_eq!(reference.calls(), 1);
    assert_eq!(p1.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_drops_results_and_stops_groups() {
    let mut settings = fast_settings();
    settings.group_size = 2;
    settings.inter_group_delay = Duration::from_millis(1_000);

    let reference = ScriptedReference::flat();
    let p1 = ScriptedQuote::respond(300, 500.0);
    let tokens: Vec<Token> = ["A", "B", "C", "D"]
        .iter()
        .map(|id| token(id, &[("p1", Direction::Forward)]))
        .collect();
    let consumer = RecordingConsumer::new();
    let engine = Arc::new(engine(
        settings,
        sources(reference.clone(), &[("p1", p1.clone())]),
        &tokens,
        &consumer,
    ));

    let handle = engine.start(tokens);
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.cancel();
    let report = tokio_test::assert_ok!(handle.wait().await);

    assert!(report.cancelled);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(reference.calls(), 2);
    assert_eq!(p1.calls(), 2);
    assert_eq!(report.outcomes.dropped_after_cancel, 2);
    assert_eq!(report.outcomes.terminal(), 0);
    assert!(consumer.terminal_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_token_removed_mid_scan_is_skipped() {
    let mut settings = fast_settings();
    settings.group_size = 1;
    settings.inter_group_delay = Duration::from_millis(500);

    let reference = ScriptedReference::flat();
    let tokens = vec![
        token("A", &[("p1", Direction::Forward)]),
        token("B", &[("p1", Direction::Forward)]),
    ];
    let consumer = RecordingConsumer::new();
    let engine = Arc::new(engine(
        settings,
        sources(reference.clone(), &[("p1", ScriptedQuote::respond(100, 500.0))]),
        &tokens,
        &consumer,
    ));

    let handle = engine.start(tokens);
    let progress = handle.progress();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(engine.book().remove("B").is_some());
    let report = tokio_test::assert_ok!(handle.wait().await);

    assert_eq!(reference.calls(), 1);
    assert_eq!(report.tokens_skipped, 1);
    assert_eq!(report.tokens_processed, 1);
    assert!(consumer.for_token("B").is_empty());
    assert_eq!(consumer.for_token("A").len(), 1);
    assert_eq!(progress.borrow().completed, 2);
}

// ---------------------------------------------------------------------------
// Readiness and reference
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_readiness_rejection_makes_no_quote_calls() {
    let p1 = ScriptedQuote::respond(100, 500.0);
    let mut bad = token("BAD", &[("p1", Direction::Forward)]);
    bad.left.contract = "0x1234".to_string();
    let ghost = token("GHOST", &[("ghost", Direction::Forward)]);

    let consumer = RecordingConsumer::new();
    let engine = engine(
        fast_settings(),
        sources(ScriptedReference::flat(), &[("p1", p1.clone())]),
        &[bad.clone(), ghost.clone()],
        &consumer,
    );

    let report = engine.run(vec![bad, ghost], CancelFlag::new()).await;

    assert_eq!(p1.calls(), 0);
    assert_eq!(report.outcomes.failed, 2);
    for (_, event) in consumer.terminal_events() {
        let error = event.error.unwrap();
        assert_eq!(error.status, RouteStatus::Failed);
        assert_eq!(error.kind, ErrorKind::ReadinessRejected);
    }
    let ghost_events = consumer.for_token("GHOST");
    assert!(ghost_events[0].error.as_ref().unwrap().message.contains("ghost"));
}

#[tokio::test(start_paused = true)]
async fn test_reference_unavailable_emits_one_token_error() {
    let reference = ScriptedReference::failing_first(usize::MAX);
    let p1 = ScriptedQuote::respond(100, 500.0);
    let mut settings = fast_settings();
    settings.reference_attempts = 3;
    settings.reference_retry_delay = Duration::from_millis(500);

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        settings,
        sources(reference.clone(), &[("p1", p1.clone())]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    assert_eq!(reference.calls(), 3);
    assert_eq!(p1.calls(), 0);
    assert_eq!(report.reference_unavailable, 1);

    let events = consumer.events();
    assert_eq!(events.len(), 1);
    let error = events[0].1.error.as_ref().unwrap();
    assert!(error.key.is_none());
    assert_eq!(error.kind, ErrorKind::ReferenceUnavailable);
}

#[tokio::test(start_paused = true)]
async fn test_reference_recovers_after_retry() {
    let reference = ScriptedReference::failing_first(1);
    let p1 = ScriptedQuote::respond(100, 500.0);

    let t = token("T", &[("p1", Direction::Forward)]);
    let consumer = RecordingConsumer::new();
    let engine = engine(
        fast_settings(),
        sources(reference.clone(), &[("p1", p1.clone())]),
        &[t.clone()],
        &consumer,
    );

    let report = engine.run(vec![t], CancelFlag::new()).await;

    assert_eq!(reference.calls(), 2);
    assert_eq!(p1.calls(), 1);
    assert_eq!(report.outcomes.success, 1);
}
