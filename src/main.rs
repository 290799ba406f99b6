//! ROUTESCAN: quote orchestration engine for CEX/DEX route pricing.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! builds the quote sources and runs a scan pass every interval until
//! Ctrl+C, cancelling the pass in flight on shutdown.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use routescan::config::{self, ScanSettings};
use routescan::dashboard::{self, DashboardState};
use routescan::engine::sink::{Fanout, TracingConsumer};
use routescan::engine::{ScanEngine, ScanReport, TokenBook};
use routescan::sources;

const BANNER: &str = r#"
 ____   ___  _   _ _____ _____ ____   ____    _    _   _
|  _ \ / _ \| | | |_   _| ____/ ___| / ___|  / \  | \ | |
| |_) | | | | | | | | | |  _| \___ \| |     / _ \ |  \| |
|  _ <| |_| | |_| | | | | |___ ___) | |___ / ___ \| |\  |
|_| \_\\___/ \___/  |_| |_____|____/ \____/_/   \_\_| \_|

  CEX/DEX route pricing, v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        tokens = cfg.tokens.len(),
        mode = ?cfg.sources.mode,
        interval_secs = cfg.scan.interval_secs,
        group_size = cfg.scan.group_size,
        "ROUTESCAN starting up"
    );

    // -- Initialise components -------------------------------------------

    let sources = sources::build(&cfg)?;
    info!(providers = ?sources.providers(), "Quote sources ready");

    let book = TokenBook::new(cfg.tokens());
    let dashboard_state = Arc::new(DashboardState::new());
    let consumer = Fanout::new()
        .with(Arc::new(TracingConsumer))
        .with(dashboard_state.clone());

    if cfg.dashboard.enabled {
        dashboard::spawn_dashboard(dashboard_state, cfg.dashboard.port).await?;
    }

    let engine = Arc::new(ScanEngine::new(
        ScanSettings::from_config(&cfg),
        sources,
        book,
        Arc::new(consumer),
    ));

    // -- Main loop -------------------------------------------------------

    let mut interval = tokio::time::interval(Duration::from_secs(cfg.scan.interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!(
        interval_secs = cfg.scan.interval_secs,
        "Entering main loop. Press Ctrl+C to stop."
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let tokens = engine.book().tokens();
                if tokens.is_empty() {
                    warn!("No tokens configured, nothing to scan");
                    continue;
                }

                let handle = engine.start(tokens);
                let cancel = handle.cancel_flag();
                let pass = handle.wait();
                tokio::pin!(pass);
                tokio::select! {
                    report = &mut pass => match report {
                        Ok(report) => log_report(&report),
                        Err(e) => error!(error = %e, "Scan pass failed, continuing to next"),
                    },
                    _ = &mut shutdown => {
                        info!("Shutdown signal received, cancelling scan in flight.");
                        cancel.cancel();
                        match pass.as_mut().await {
                            Ok(report) => log_report(&report),
                            Err(e) => error!(error = %e, "Scan pass failed during shutdown"),
                        }
                        break;
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received.");
                break;
            }
        }
    }

    info!("ROUTESCAN shut down cleanly.");
    Ok(())
}

/// Log a human-readable pass summary.
fn log_report(report: &ScanReport) {
    let o = &report.outcomes;
    info!(
        run_id = %report.run_id,
        elapsed_ms = report.elapsed.as_millis() as u64,
        tokens = report.tokens_total,
        groups = report.groups.len(),
        success = o.success,
        fallback_success = o.fallback_success,
        errors = o.error + o.fallback_error,
        failed = o.failed,
        swept = o.swept,
        late_dropped = o.late_dropped,
        max_batch_ms = report.drain.max_batch_elapsed.as_millis() as u64,
        "Pass complete"
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("routescan=info"));

    let json_logging = std::env::var("ROUTESCAN_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
