//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`,
//! which is also registered with the engine as a [`RouteEventConsumer`].

use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::engine::sink::RouteEventConsumer;
use crate::engine::ScanReport;
use crate::types::{RouteError, RouteEvent, ScanProgress};

/// Most recent errors kept for `/api/errors`.
pub const ERROR_HISTORY: usize = 200;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    progress: RwLock<ScanProgress>,
    /// Latest event per route key.
    routes: RwLock<HashMap<String, RouteEvent>>,
    errors: RwLock<VecDeque<RouteError>>,
    report: RwLock<Option<ScanReport>>,
    events: AtomicU64,
    started: DateTime<Utc>,
}

pub type AppState = Arc<DashboardState>;

impl DashboardState {
    pub fn new() -> Self {
        Self {
            progress: RwLock::new(ScanProgress::default()),
            routes: RwLock::new(HashMap::new()),
            errors: RwLock::new(VecDeque::with_capacity(ERROR_HISTORY)),
            report: RwLock::new(None),
            events: AtomicU64::new(0),
            started: Utc::now(),
        }
    }

    pub fn events_seen(&self) -> u64 {
        self.events.load(Ordering::Relaxed)
    }
}

impl Default for DashboardState {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteEventConsumer for DashboardState {
    fn on_event(&self, event: &RouteEvent) {
        self.events.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = &event.error {
            let mut errors = self.errors.write();
            if errors.len() == ERROR_HISTORY {
                errors.pop_front();
            }
            errors.push_back(error.clone());
        }

        if let Some(key) = &event.key {
            let mut routes = self.routes.write();
            let mut event = event.clone();
            // Interim events carry no token id; keep the one we already know.
            if event.token_id.is_none() {
                event.token_id = routes.get(key.as_str()).and_then(|e| e.token_id.clone());
            }
            routes.insert(key.as_str().to_string(), event);
        }
    }

    fn on_progress(&self, progress: &ScanProgress) {
        *self.progress.write() = progress.clone();
    }

    fn on_report(&self, report: &ScanReport) {
        *self.report.write() = Some(report.clone());
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ProgressResponse {
    pub completed: usize,
    pub total: usize,
    pub fraction: f64,
    pub elapsed_ms: u64,
    pub current_label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: i64,
    pub events_seen: u64,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /api/progress
pub async fn get_progress(State(state): State<AppState>) -> Json<ProgressResponse> {
    let progress = state.progress.read();
    Json(ProgressResponse {
        completed: progress.completed,
        total: progress.total,
        fraction: progress.fraction(),
        elapsed_ms: progress.elapsed.as_millis() as u64,
        current_label: progress.current_label.clone(),
    })
}

/// GET /api/routes
///
/// Latest state of every route seen, ordered by key.
pub async fn get_routes(State(state): State<AppState>) -> Json<Vec<RouteEvent>> {
    let routes = state.routes.read();
    let mut out: Vec<RouteEvent> = routes.values().cloned().collect();
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Json(out)
}

/// GET /api/errors
///
/// Newest first.
pub async fn get_errors(State(state): State<AppState>) -> Json<Vec<RouteError>> {
    let errors = state.errors.read();
    Json(errors.iter().rev().cloned().collect())
}

/// GET /api/report
///
/// 404 until the first run has finished.
pub async fn get_report(State(state): State<AppState>) -> Result<Json<ScanReport>, StatusCode> {
    state.report.read().clone().map(Json).ok_or(StatusCode::NOT_FOUND)
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: (Utc::now() - state.started).num_seconds(),
        events_seen: state.events_seen(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
