//! Recovery synchronization trackers.
//!
//! Each recovery phase fans a request out to several servers and waits
//! for their completion reports. A tracker aggregates those reports under
//! one operation id and attempt number, and bounds the wait: when the
//! deadline elapses, every still-outstanding item is force-completed with
//! a timeout result, so the coordinator always observes a concrete
//! per-item outcome within bounded time.
//!
//! Reports from an earlier attempt are identified by their stale attempt
//! number and dropped without moving any counter.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tabulite_types::{ErrorCode, QualifiedRangeSpec};
use tracing::{info, warn};

// ============================================================================
// Replay tracker (per-fragment completion)
// ============================================================================

#[derive(Debug, Default)]
struct ReplayInner {
    outstanding: BTreeSet<u32>,
    errors: BTreeMap<u32, ErrorCode>,
    has_errors: bool,
    timed_out: bool,
    done: bool,
}

/// Aggregates per-fragment completion of one replay attempt.
#[derive(Debug)]
pub struct ReplayTracker {
    attempt: u32,
    inner: Mutex<ReplayInner>,
    cond: Condvar,
}

impl ReplayTracker {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            inner: Mutex::new(ReplayInner::default()),
            cond: Condvar::new(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Registers fragments whose completion this tracker awaits.
    pub fn add(&self, fragments: &[u32]) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding.extend(fragments.iter().copied());
    }

    /// Applies one replay-complete report.
    ///
    /// Returns false (and changes nothing) if the report's attempt does
    /// not match this tracker's attempt.
    pub fn complete(&self, attempt: u32, results: &[(u32, ErrorCode)]) -> bool {
        if attempt != self.attempt {
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        for &(fragment, error) in results {
            if !inner.outstanding.remove(&fragment) {
                warn!(fragment, "completion for non-pending fragment");
                continue;
            }
            if !error.is_ok() {
                inner.has_errors = true;
            }
            inner.errors.insert(fragment, error);
        }
        if inner.outstanding.is_empty() {
            inner.done = true;
            self.cond.notify_all();
        }
        true
    }

    /// Records a local send failure for fragments that never reached
    /// their player.
    pub fn set_errors(&self, fragments: &[u32], error: ErrorCode) {
        let mut inner = self.inner.lock().unwrap();
        for &fragment in fragments {
            inner.outstanding.remove(&fragment);
            inner.errors.insert(fragment, error);
        }
        inner.has_errors = true;
        if inner.outstanding.is_empty() {
            inner.done = true;
            self.cond.notify_all();
        }
    }

    /// Blocks until every fragment completed or `timeout` elapsed.
    ///
    /// On timeout every outstanding fragment is recorded with
    /// [`ErrorCode::RequestTimeout`]. Returns true if any fragment
    /// reported an error or the wait timed out.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while !inner.outstanding.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                info!("replay tracker timed out");
                inner.has_errors = true;
                inner.timed_out = true;
                let remaining: Vec<u32> = inner.outstanding.iter().copied().collect();
                for fragment in remaining {
                    inner.errors.insert(fragment, ErrorCode::RequestTimeout);
                }
                inner.outstanding.clear();
                break;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        inner.done = true;
        inner.has_errors
    }

    /// Per-fragment results; meaningful once the wait finished.
    pub fn errors(&self) -> BTreeMap<u32, ErrorCode> {
        let inner = self.inner.lock().unwrap();
        assert!(inner.done, "replay tracker results read before completion");
        inner.errors.clone()
    }

    pub fn timed_out(&self) -> bool {
        self.inner.lock().unwrap().timed_out
    }
}

// ============================================================================
// Range tracker (per-range completion)
// ============================================================================

#[derive(Debug, Default)]
struct RangeInner {
    outstanding: BTreeSet<QualifiedRangeSpec>,
    results: Vec<(QualifiedRangeSpec, ErrorCode)>,
    has_errors: bool,
    timed_out: bool,
    done: bool,
}

/// Aggregates per-range completion of one prepare or commit attempt.
#[derive(Debug)]
pub struct RangeTracker {
    attempt: u32,
    inner: Mutex<RangeInner>,
    cond: Condvar,
}

impl RangeTracker {
    pub fn new(attempt: u32) -> Self {
        Self {
            attempt,
            inner: Mutex::new(RangeInner::default()),
            cond: Condvar::new(),
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn add(&self, ranges: &[QualifiedRangeSpec]) {
        let mut inner = self.inner.lock().unwrap();
        inner.outstanding.extend(ranges.iter().cloned());
    }

    /// Applies one prepare/commit completion report. Stale attempts and
    /// non-pending ranges are dropped with a warning.
    pub fn result_callback(&self, attempt: u32, results: &[(QualifiedRangeSpec, ErrorCode)]) {
        if attempt != self.attempt {
            warn!(
                attempt,
                expected = self.attempt,
                "dropping completion from stale attempt"
            );
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        for (range, error) in results {
            if !inner.outstanding.remove(range) {
                warn!(%range, "completion for non-pending range");
                continue;
            }
            if !error.is_ok() {
                inner.has_errors = true;
            }
            inner.results.push((range.clone(), *error));
        }
        if inner.outstanding.is_empty() {
            inner.done = true;
            self.cond.notify_all();
        }
    }

    /// Records a local send failure for ranges whose request never
    /// reached the destination.
    pub fn set_range_errors(&self, ranges: &[QualifiedRangeSpec], error: ErrorCode) {
        let mut inner = self.inner.lock().unwrap();
        for range in ranges {
            if inner.outstanding.remove(range) {
                inner.results.push((range.clone(), error));
            }
        }
        inner.has_errors = true;
        if inner.outstanding.is_empty() {
            inner.done = true;
            self.cond.notify_all();
        }
    }

    /// Blocks until every range completed or `timeout` elapsed; on
    /// timeout the outstanding ranges are recorded with
    /// [`ErrorCode::RequestTimeout`]. Returns true on any error.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while !inner.outstanding.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                info!("range tracker timed out");
                inner.has_errors = true;
                inner.timed_out = true;
                let remaining: Vec<QualifiedRangeSpec> =
                    inner.outstanding.iter().cloned().collect();
                for range in remaining {
                    inner.results.push((range, ErrorCode::RequestTimeout));
                }
                inner.outstanding.clear();
                break;
            }
            let (guard, _) = self.cond.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
        inner.done = true;
        inner.has_errors
    }

    pub fn results(&self) -> Vec<(QualifiedRangeSpec, ErrorCode)> {
        let inner = self.inner.lock().unwrap();
        assert!(inner.done, "range tracker results read before completion");
        inner.results.clone()
    }

    pub fn timed_out(&self) -> bool {
        self.inner.lock().unwrap().timed_out
    }
}
