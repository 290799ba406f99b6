//! Watchdog timer manager.
//!
//! One-shot deferred callbacks keyed by an operation identity. Each armed
//! timer is a spawned tokio task; the table keeps its `AbortHandle` so
//! `cancel` can stop it before it fires. A timer that fires removes its own
//! entry before running the callback, so a key is never fired twice.
//!
//! When deferral is enabled and the [`Visibility`] predicate says the
//! consumer is hidden, a fired timer re-probes every `probe_interval`
//! instead of running, and fires once the consumer is observable again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

// ---------------------------------------------------------------------------
// Visibility predicate
// ---------------------------------------------------------------------------

/// Whether the consuming surface is currently not observable.
pub trait Visibility: Send + Sync {
    fn should_defer(&self) -> bool;
}

/// Host without a notion of visibility: never defer.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysVisible;

impl Visibility for AlwaysVisible {
    fn should_defer(&self) -> bool {
        false
    }
}

/// Toggle for embedders that track whether their surface is shown.
#[derive(Debug, Default)]
pub struct VisibilityFlag {
    hidden: AtomicBool,
}

impl VisibilityFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }
}

impl Visibility for VisibilityFlag {
    fn should_defer(&self) -> bool {
        self.is_hidden()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub type WatchdogCallback = Box<dyn FnOnce() + Send + 'static>;

struct Armed {
    id: u64,
    handle: AbortHandle,
}

/// Table of armed watchdogs. Cheap to clone; clones share the table.
#[derive(Clone)]
pub struct WatchdogManager {
    timers: Arc<Mutex<HashMap<String, Armed>>>,
    visibility: Arc<dyn Visibility>,
    defer_when_hidden: bool,
    probe_interval: Duration,
    next_id: Arc<AtomicU64>,
    fired: Arc<AtomicU64>,
    deferred: Arc<AtomicU64>,
}

impl WatchdogManager {
    pub fn new(
        visibility: Arc<dyn Visibility>,
        defer_when_hidden: bool,
        probe_interval: Duration,
    ) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            visibility,
            defer_when_hidden,
            probe_interval,
            next_id: Arc::new(AtomicU64::new(0)),
            fired: Arc::new(AtomicU64::new(0)),
            deferred: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `callback` after `after` unless cancelled first.
    ///
    /// Arming a key that is already armed cancels the old timer.
    /// Must be called from within a tokio runtime.
    pub fn arm(&self, key: impl Into<String>, after: Duration, callback: WatchdogCallback) {
        let key = key.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let timers = Arc::clone(&self.timers);
        let visibility = Arc::clone(&self.visibility);
        let fired = Arc::clone(&self.fired);
        let deferred = Arc::clone(&self.deferred);
        let defer_when_hidden = self.defer_when_hidden;
        let probe_interval = self.probe_interval;
        let task_key = key.clone();

        // Hold the table lock until the entry is inserted so a zero-length
        // timer cannot look itself up before it exists.
        let mut table = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;

            if defer_when_hidden {
                while visibility.should_defer() {
                    deferred.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %task_key, "Watchdog deferred while consumer hidden");
                    tokio::time::sleep(probe_interval).await;
                }
            }

            let still_armed = {
                let mut t = timers.lock();
                match t.get(&task_key) {
                    Some(armed) if armed.id == id => {
                        t.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };

            if still_armed {
                fired.fetch_add(1, Ordering::Relaxed);
                debug!(key = %task_key, "Watchdog fired");
                callback();
            }
        })
        .abort_handle();

        if let Some(previous) = table.insert(key, Armed { id, handle }) {
            previous.handle.abort();
        }
    }

    /// Cancel one timer. Returns `true` if it was still armed.
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().remove(key) {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every listed key. Returns how many were still armed.
    pub fn cancel_all<I, K>(&self, keys: I) -> usize
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let mut table = self.timers.lock();
        keys.into_iter()
            .filter_map(|k| table.remove(k.as_ref()))
            .map(|armed| armed.handle.abort())
            .count()
    }

    /// Abort everything still armed. Used when a run ends.
    pub fn clear(&self) -> usize {
        let mut table = self.timers.lock();
        let n = table.len();
        for (_, armed) in table.drain() {
            armed.handle.abort();
        }
        n
    }

    /// Hidden right now, and configured to defer because of it.
    pub fn is_deferring(&self) -> bool {
        self.defer_when_hidden && self.visibility.should_defer()
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.timers.lock().contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.lock().len()
    }

    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Number of probe cycles spent deferring while hidden.
    pub fn deferred_count(&self) -> u64 {
        self.deferred.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
