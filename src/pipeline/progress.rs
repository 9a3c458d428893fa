//! Fractional progress of one pipeline invocation.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Any computed value at or above this is held back to [`HOLD_VALUE`]
/// until the very last unit of the run completes.
pub const HOLD_THRESHOLD: f64 = 0.994;

/// Value shown while the final unit is still outstanding.
pub const HOLD_VALUE: f64 = 0.99;

/// Progress at or above this counts as done.
pub const DONE_THRESHOLD: f64 = 0.999;

#[derive(Debug, Default)]
struct TrackerState {
    step_size: f64,
    units_done: usize,
    units_total: usize,
}

/// Single-writer progress scalar for one run.
///
/// One unit is one image through one stage, so
/// `step_size = 1 / (stage_count * image_count)`. The value never decreases
/// between two calls to [`ProgressTracker::begin`].
#[derive(Debug)]
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
    published: watch::Sender<f64>,
}

impl ProgressTracker {
    pub fn new() -> Arc<Self> {
        let (published, _rx) = watch::channel(0.0);
        Arc::new(Self {
            state: Mutex::new(TrackerState::default()),
            published,
        })
    }

    /// Reset to zero for a run of `stage_count` stages over `image_count` images.
    pub fn begin(&self, stage_count: usize, image_count: usize) {
        let units_total = stage_count * image_count;
        let mut state = self.lock();
        state.units_total = units_total;
        state.units_done = 0;
        state.step_size = if units_total > 0 {
            1.0 / units_total as f64
        } else {
            0.0
        };
        self.published.send_replace(0.0);
        tracing::debug!("Progress step: {:.6} ({} units)", state.step_size, units_total);
    }

    pub fn step_size(&self) -> f64 {
        self.lock().step_size
    }

    /// A whole unit completed.
    pub fn advance(&self) {
        let mut state = self.lock();
        if state.units_done < state.units_total {
            state.units_done += 1;
        }
        let computed = state.units_done as f64 * state.step_size;
        let value = if state.units_total > 0 && state.units_done == state.units_total {
            1.0
        } else {
            hold_back(computed)
        };
        self.publish(value);
    }

    /// Part of the current unit completed, as reported by a stage program.
    pub fn advance_partial(&self, fraction_of_step: f64) {
        let state = self.lock();
        let fraction = fraction_of_step.clamp(0.0, 1.0);
        let computed = (state.units_done as f64 + fraction) * state.step_size;
        self.publish(hold_back(computed));
    }

    /// Current published value.
    pub fn value(&self) -> f64 {
        *self.published.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.value() >= DONE_THRESHOLD
    }

    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.lock();
        ProgressSnapshot {
            progress: self.value(),
            step_size: state.step_size,
            units_done: state.units_done,
            units_total: state.units_total,
        }
    }

    fn publish(&self, value: f64) {
        self.published.send_if_modified(|current| {
            if value > *current {
                *current = value;
                tracing::info!("Progress: {:.4}", value);
                true
            } else {
                false
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        // A poisoned lock only means a panicking writer; the scalars stay valid.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn hold_back(value: f64) -> f64 {
    if value >= HOLD_THRESHOLD {
        HOLD_VALUE
    } else {
        value
    }
}

/// Point-in-time view of a tracker.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub progress: f64,
    pub step_size: f64,
    pub units_done: usize,
    pub units_total: usize,
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.1}%] {}/{} units",
            self.progress * 100.0,
            self.units_done,
            self.units_total
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_size_full_run() {
        let tracker = ProgressTracker::new();
        tracker.begin(5, 4);
        assert!((tracker.step_size() - 1.0 / 20.0).abs() < 1e-12);
        assert_eq!(tracker.value(), 0.0);
    }

    #[test]
    fn test_full_run_reaches_exactly_one() {
        for images in [1, 3, 7] {
            let tracker = ProgressTracker::new();
            tracker.begin(5, images);
            for _ in 0..5 * images {
                assert!(tracker.value() < 1.0);
                tracker.advance();
            }
            assert!((tracker.value() - 1.0).abs() < 1e-9);
            assert!(tracker.is_done());
        }
    }

    #[test]
    fn test_partial_value_is_held_at_099() {
        let tracker = ProgressTracker::new();
        tracker.begin(3, 1);
        tracker.advance();
        tracker.advance();

        // (2 + 0.994) / 3 = 0.998
        tracker.advance_partial(0.994);
        assert_eq!(tracker.value(), HOLD_VALUE);
        assert!(!tracker.is_done());

        tracker.advance();
        assert_eq!(tracker.value(), 1.0);
    }

    #[test]
    fn test_non_final_advance_is_held() {
        // 200 units: unit 199 computes 0.995
        let tracker = ProgressTracker::new();
        tracker.begin(5, 40);
        for _ in 0..199 {
            tracker.advance();
        }
        assert_eq!(tracker.value(), HOLD_VALUE);
        tracker.advance();
        assert_eq!(tracker.value(), 1.0);
    }

    #[test]
    fn test_partial_is_relative_to_current_step() {
        let tracker = ProgressTracker::new();
        tracker.begin(2, 2);
        tracker.advance();
        tracker.advance_partial(0.5);
        assert!((tracker.value() - 0.375).abs() < 1e-12);
        tracker.advance_partial(1.0);
        assert!((tracker.value() - 0.5).abs() < 1e-12);
        tracker.advance();
        assert!((tracker.value() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_under_lower_hint() {
        let tracker = ProgressTracker::new();
        tracker.begin(1, 2);
        tracker.advance_partial(0.8);
        let high = tracker.value();
        tracker.advance_partial(0.2);
        assert_eq!(tracker.value(), high);
    }

    #[test]
    fn test_begin_resets() {
        let tracker = ProgressTracker::new();
        tracker.begin(1, 1);
        tracker.advance();
        assert!(tracker.is_done());

        tracker.begin(2, 1);
        assert_eq!(tracker.value(), 0.0);
        assert!(!tracker.is_done());
    }

    #[test]
    fn test_snapshot_display() {
        let tracker = ProgressTracker::new();
        tracker.begin(2, 2);
        tracker.advance();
        let display = format!("{}", tracker.snapshot());
        assert!(display.contains("25.0%"));
        assert!(display.contains("1/4"));
    }
}
