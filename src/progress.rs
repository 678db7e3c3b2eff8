// ============================================================================
// ATOMIC PROGRESS — shared cancellation + progress token for background work
// ============================================================================
//
// One `ProgressShared` lives behind an `Arc` for the whole lifetime of a task.
// Every handle (the task's own, the poller's clone, and any `child()` derived
// for a sub-stage) points at the same state, so cancellation is a single
// flag and children write straight into the parent's fraction.
//
// The fraction is stored as fixed point in an `AtomicI64` so that
// `advance()` can be a lock-free `fetch_add` from many rayon workers at
// once.  A negative raw value means "indeterminate".

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

const FRACTION_BITS: u32 = 30;
const SCALE: f64 = (1u64 << FRACTION_BITS) as f64;
const BUSY: i64 = -1;

fn to_fixed(value: f32) -> i64 {
    (value as f64 * SCALE).round() as i64
}

fn from_fixed(raw: i64) -> f32 {
    (raw as f64 / SCALE) as f32
}

/// What a poller sees when it asks a task how far along it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressState {
    /// Nothing is running.
    Idle,
    /// Work is happening but no meaningful fraction is available.
    Indeterminate,
    /// Fraction of the work done, in `[0, 1]`.
    Fraction(f32),
}

impl ProgressState {
    /// Fraction for progress bars; `None` while indeterminate.
    pub fn fraction(&self) -> Option<f32> {
        match self {
            ProgressState::Idle => Some(1.0),
            ProgressState::Indeterminate => None,
            ProgressState::Fraction(f) => Some(*f),
        }
    }
}

#[derive(Debug)]
struct ProgressShared {
    value: AtomicI64,
    cancelled: AtomicBool,
}

/// Thread-safe cancellation and progress token.
///
/// Cloning a handle shares the underlying state.  `child(weight)` also shares
/// it but maps the child's `[0, 1]` into a sub-range of this handle's range.
///
/// ```ignore
/// progress.set_num_steps(height);
/// for y in 0..height {
///     if progress.is_cancelled() { return Err(EditError::Cancelled); }
///     // ... one scanline ...
///     progress.advance(1);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AtomicProgress {
    shared: Arc<ProgressShared>,
    /// Absolute position of this handle's 0.0.
    offset: f32,
    /// Absolute width of this handle's range.
    span: f32,
    /// Absolute amount one `advance(1)` adds.
    step: f32,
}

impl Default for AtomicProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicProgress {
    /// Fresh token at 0 % covering the full `[0, 1]` range.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ProgressShared {
                value: AtomicI64::new(0),
                cancelled: AtomicBool::new(false),
            }),
            offset: 0.0,
            span: 1.0,
            step: 1.0,
        }
    }

    /// Fresh token that reports `Indeterminate` until something sets a fraction.
    pub fn busy() -> Self {
        let p = Self::new();
        p.set_busy();
        p
    }

    /// Derived handle covering the next `weight` of this handle's range.
    ///
    /// The child's range starts where the shared fraction currently is (or
    /// at this handle's offset if nothing has been reported yet), so a
    /// composite operation can hand each stage a child in sequence.
    pub fn child(&self, weight: f32) -> AtomicProgress {
        let weight = weight.clamp(0.0, 1.0);
        let current = match self.progress() {
            ProgressState::Fraction(f) => f,
            _ => self.offset,
        };
        let offset = current.clamp(self.offset, self.offset + self.span);
        let span = (self.span * weight).min(self.offset + self.span - offset);
        Self {
            shared: Arc::clone(&self.shared),
            offset,
            span,
            step: span,
        }
    }

    // -- cancellation ---------------------------------------------------

    /// Ask the worker to stop.  Idempotent, callable from any thread.
    pub fn request_cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    // -- progress -------------------------------------------------------

    pub fn progress(&self) -> ProgressState {
        let raw = self.shared.value.load(Ordering::Acquire);
        if raw < 0 {
            ProgressState::Indeterminate
        } else {
            ProgressState::Fraction(from_fixed(raw).clamp(0.0, 1.0))
        }
    }

    /// Report `value` (in this handle's `[0, 1]`).  Never moves the shared
    /// fraction backwards.
    pub fn set_progress(&self, value: f32) {
        let absolute = self.offset + value.clamp(0.0, 1.0) * self.span;
        self.shared
            .value
            .fetch_max(to_fixed(absolute), Ordering::AcqRel);
    }

    /// Overwrite the shared fraction, bypassing the monotonic guard.
    pub fn reset_progress(&self, value: f32) {
        self.shared
            .value
            .store(to_fixed(value.clamp(0.0, 1.0)), Ordering::Release);
    }

    /// Switch to `Indeterminate` (results being committed, no fraction).
    pub fn set_busy(&self) {
        self.shared.value.store(BUSY, Ordering::Release);
    }

    pub fn set_done(&self) {
        self.reset_progress(1.0);
    }

    // -- discrete stepping ----------------------------------------------

    /// Split this handle's range into `num_steps` equal `advance(1)` steps.
    pub fn set_num_steps(&mut self, num_steps: usize) {
        self.step = if num_steps == 0 {
            self.span
        } else {
            self.span / num_steps as f32
        };
    }

    /// Add `steps` steps to the shared fraction.  Lock-free.
    pub fn advance(&self, steps: usize) {
        let delta = to_fixed(self.step * steps as f32);
        // An indeterminate token stays indeterminate until someone resets it.
        let _ = self
            .shared
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                (raw >= 0).then(|| (raw + delta).min(to_fixed(1.0)))
            });
    }

    /// True when both handles share the same state.
    pub fn same_token(&self, other: &AtomicProgress) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fraction(p: &AtomicProgress) -> f32 {
        match p.progress() {
            ProgressState::Fraction(f) => f,
            other => panic!("expected fraction, got {:?}", other),
        }
    }

    #[test]
    fn cancel_is_sticky_and_shared() {
        let p = AtomicProgress::new();
        let clone = p.clone();
        let child = p.child(0.5);
        assert!(!p.is_cancelled());
        child.request_cancel();
        child.request_cancel();
        assert!(p.is_cancelled());
        assert!(clone.is_cancelled());
    }

    #[test]
    fn set_progress_is_monotonic() {
        let p = AtomicProgress::new();
        p.set_progress(0.6);
        p.set_progress(0.3);
        assert!((fraction(&p) - 0.6).abs() < 1e-6);
        p.reset_progress(0.1);
        assert!((fraction(&p) - 0.1).abs() < 1e-6);
    }

    #[test]
    fn busy_is_indeterminate_until_reset() {
        let p = AtomicProgress::busy();
        assert_eq!(p.progress(), ProgressState::Indeterminate);
        p.advance(3);
        assert_eq!(p.progress(), ProgressState::Indeterminate);
        p.set_done();
        assert_eq!(p.progress(), ProgressState::Fraction(1.0));
    }

    #[test]
    fn steps_accumulate() {
        let mut p = AtomicProgress::new();
        p.set_num_steps(4);
        p.advance(1);
        p.advance(2);
        assert!((fraction(&p) - 0.75).abs() < 1e-6);
        p.advance(10);
        assert!((fraction(&p) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn children_map_into_parent_ranges() {
        let p = AtomicProgress::new();
        let first = p.child(0.25);
        first.set_progress(1.0);
        assert!((fraction(&p) - 0.25).abs() < 1e-6);

        let mut second = p.child(1.0);
        second.set_num_steps(3);
        second.advance(1);
        // 0.25 + 0.75 / 3
        assert!((fraction(&p) - 0.5).abs() < 1e-5);
        second.set_progress(1.0);
        assert!((fraction(&p) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn concurrent_advances_are_not_lost() {
        use rayon::prelude::*;
        let mut p = AtomicProgress::new();
        p.set_num_steps(1000);
        (0..1000).into_par_iter().for_each(|_| p.advance(1));
        assert!((fraction(&p) - 1.0).abs() < 1e-4);
    }
}
