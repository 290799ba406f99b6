//! Per-route result slots.
//!
//! A slot is the explicit state machine behind one [`RouteKey`] in a run.
//! Non-terminal transitions go through a small mutex; the terminal one is an
//! `AtomicBool` compare-exchange, so exactly one caller ever finalizes a
//! slot no matter how many race for it (unit, watchdog path, safety sweep).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Route, RouteKey, RouteStatus};

#[derive(Debug)]
struct SlotState {
    status: RouteStatus,
    /// Nominal deadline of the current attempt, `None` when idle or final.
    deadline: Option<Instant>,
    /// When the current phase (`Checking` or `Fallback`) was entered.
    entered: Option<Instant>,
}

#[derive(Debug)]
pub struct RouteSlot {
    route: Route,
    key: RouteKey,
    state: Mutex<SlotState>,
    finalized: AtomicBool,
    queued: AtomicBool,
}

impl RouteSlot {
    pub fn new(route: Route) -> Self {
        Self {
            key: route.key(),
            route,
            state: Mutex::new(SlotState {
                status: RouteStatus::Pending,
                deadline: None,
                entered: None,
            }),
            finalized: AtomicBool::new(false),
            queued: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn status(&self) -> RouteStatus {
        self.state.lock().status
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    /// How long the current phase has been outstanding at `now`.
    pub fn waited(&self, now: Instant) -> Option<Duration> {
        self.state
            .lock()
            .entered
            .map(|entered| now.saturating_duration_since(entered))
    }

    /// `Pending → Checking`.
    pub fn begin_check(&self, deadline: Instant) -> bool {
        self.transition(RouteStatus::Pending, RouteStatus::Checking, deadline)
    }

    /// `Checking → Fallback`, with a fresh deadline for the fallback attempt.
    pub fn enter_fallback(&self, deadline: Instant) -> bool {
        self.transition(RouteStatus::Checking, RouteStatus::Fallback, deadline)
    }

    fn transition(&self, from: RouteStatus, to: RouteStatus, deadline: Instant) -> bool {
        let mut state = self.state.lock();
        if self.is_final() || state.status != from {
            return false;
        }
        state.status = to;
        state.deadline = Some(deadline);
        state.entered = Some(Instant::now());
        true
    }

    /// Write the terminal status. Returns `false` if the slot was already
    /// final, in which case nothing changes.
    pub fn finalize(&self, status: RouteStatus) -> bool {
        debug_assert!(status.is_terminal());
        if self
            .finalized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let mut state = self.state.lock();
        state.status = status;
        state.deadline = None;
        state.entered = None;
        true
    }

    pub fn is_final(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// A terminal item for this slot is waiting in the result queue.
    pub fn mark_queued(&self) {
        self.queued.store(true, Ordering::Release);
    }

    pub fn is_queued(&self) -> bool {
        self.queued.load(Ordering::Acquire)
    }
}

/// All slots of one run.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Mutex<HashMap<RouteKey, Arc<RouteSlot>>>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a slot for `route`. Returns `None` while a live (non-final)
    /// slot already exists for the same key.
    pub fn open(&self, route: &Route) -> Option<Arc<RouteSlot>> {
        let key = route.key();
        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(&key) {
            if !existing.is_final() {
                return None;
            }
        }
        let slot = Arc::new(RouteSlot::new(route.clone()));
        slots.insert(key, Arc::clone(&slot));
        Some(slot)
    }

    pub fn get(&self, key: &RouteKey) -> Option<Arc<RouteSlot>> {
        self.slots.lock().get(key).cloned()
    }

    /// Drop a live slot without finalizing it (cancelled run).
    pub fn abandon(&self, key: &RouteKey) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if !slot.is_final() => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Non-final slots whose deadline passed more than `grace` ago.
    pub fn overdue(&self, now: Instant, grace: Duration) -> Vec<Arc<RouteSlot>> {
        self.slots
            .lock()
            .values()
            .filter(|slot| !slot.is_final())
            .filter(|slot| matches!(slot.deadline(), Some(d) if d + grace <= now))
            .cloned()
            .collect()
    }

    /// Latest deadline among live slots.
    pub fn latest_deadline(&self) -> Option<Instant> {
        self.slots
            .lock()
            .values()
            .filter(|slot| !slot.is_final())
            .filter_map(|slot| slot.deadline())
            .max()
    }

    pub fn live_count(&self) -> usize {
        self.slots.lock().values().filter(|s| !s.is_final()).count()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
