//! Progress reporting and cooperative cancellation.
//!
//! Long-running work receives a [`RefreshContext`]: a progress sink plus a
//! cancel predicate, passed by reference all the way down. Loops report and
//! poll at a fixed stride ([`PROGRESS_REDUCE`]) via [`ProgressTicker`] rather
//! than on every record.

use crate::constants::PROGRESS_REDUCE;

/// A snapshot of how far a multi-step operation has progressed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressData {
    /// 1-based index of the current step.
    pub step: usize,
    /// Total number of steps in the operation.
    pub max_step: usize,
    /// Human-readable name for the current step (eg "Extrema", "Count").
    pub step_name: String,
    /// Percentage completion of the current step, 0-100.
    pub progress: u32,
}

impl ProgressData {
    pub fn reset(&mut self) {
        *self = ProgressData::default();
    }
}

/// The progress sink and cancel predicate threaded through `refresh`.
///
/// The sink may block briefly while a UI coalesces updates. The cancel
/// predicate is polled at the tick stride; once it returns `true` the
/// operation must tear down promptly and report an aborted error.
pub struct RefreshContext<'a> {
    progress: &'a mut dyn FnMut(&ProgressData),
    cancel: &'a (dyn Fn() -> bool + Sync),
    current: ProgressData,
}

impl<'a> RefreshContext<'a> {
    pub fn new(
        progress: &'a mut dyn FnMut(&ProgressData),
        cancel: &'a (dyn Fn() -> bool + Sync),
    ) -> RefreshContext<'a> {
        RefreshContext {
            progress,
            cancel,
            current: ProgressData::default(),
        }
    }

    /// Enters a new step of the operation and announces it.
    pub fn begin_step(&mut self, step: usize, max_step: usize, step_name: &str) {
        self.current.step = step;
        self.current.max_step = max_step;
        self.current.step_name = step_name.to_string();
        self.current.progress = 0;
        (self.progress)(&self.current);
    }

    /// Reports percentage completion of the current step.
    pub fn report(&mut self, percent: u32) {
        self.current.progress = percent.min(100);
        (self.progress)(&self.current);
    }

    /// Polls the cancel predicate.
    pub fn cancelled(&self) -> bool {
        (self.cancel)()
    }

    /// A shareable handle on the cancel predicate, for polling from inside
    /// data-parallel regions.
    pub fn cancel_handle(&self) -> &'a (dyn Fn() -> bool + Sync) {
        self.cancel
    }

    pub fn snapshot(&self) -> &ProgressData {
        &self.current
    }
}

/// Counts work items and, every [`PROGRESS_REDUCE`] of them, reports progress
/// and polls for cancellation.
pub struct ProgressTicker {
    done: usize,
    total: usize,
    countdown: usize,
}

impl ProgressTicker {
    pub fn new(total: usize) -> ProgressTicker {
        ProgressTicker {
            done: 0,
            total,
            countdown: PROGRESS_REDUCE,
        }
    }

    /// Records one completed work item. Returns `false` when cancellation has
    /// been requested; the caller must unwind and return its aborted error.
    #[must_use]
    pub fn tick(&mut self, ctx: &mut RefreshContext<'_>) -> bool {
        self.done += 1;
        self.countdown -= 1;
        if self.countdown == 0 {
            self.countdown = PROGRESS_REDUCE;
            let percent = if self.total == 0 {
                100
            } else {
                (self.done * 100 / self.total) as u32
            };
            ctx.report(percent);
            if ctx.cancelled() {
                return false;
            }
        }
        true
    }
}

/// A context that discards progress and never cancels; handy for tests and
/// for the convenience entry points.
pub fn run_unwatched<T>(work: impl FnOnce(&mut RefreshContext<'_>) -> T) -> T {
    let mut sink = |_: &ProgressData| {};
    let cancel = || false;
    let mut ctx = RefreshContext::new(&mut sink, &cancel);
    work(&mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_reports_at_stride() {
        let mut updates = Vec::new();
        let mut sink = |p: &ProgressData| updates.push(p.progress);
        let cancel = || false;
        let mut ctx = RefreshContext::new(&mut sink, &cancel);

        let total = PROGRESS_REDUCE * 2;
        let mut ticker = ProgressTicker::new(total);
        for _ in 0..total {
            assert!(ticker.tick(&mut ctx));
        }
        assert_eq!(updates, vec![50, 100]);
    }

    #[test]
    fn ticker_detects_cancellation() {
        let mut sink = |_: &ProgressData| {};
        let cancel = || true;
        let mut ctx = RefreshContext::new(&mut sink, &cancel);

        let mut ticker = ProgressTicker::new(PROGRESS_REDUCE);
        let mut survived = 0usize;
        for _ in 0..PROGRESS_REDUCE {
            if !ticker.tick(&mut ctx) {
                break;
            }
            survived += 1;
        }
        assert_eq!(survived, PROGRESS_REDUCE - 1);
    }

    #[test]
    fn steps_are_announced() {
        let mut names = Vec::new();
        let mut sink = |p: &ProgressData| names.push((p.step, p.step_name.clone()));
        let cancel = || false;
        let mut ctx = RefreshContext::new(&mut sink, &cancel);
        ctx.begin_step(1, 2, "Pre-allocate");
        ctx.begin_step(2, 2, "Range");
        assert_eq!(
            names,
            vec![(1, "Pre-allocate".to_string()), (2, "Range".to_string())]
        );
    }
}
