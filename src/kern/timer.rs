//! Kernel timer
//!
//! A monotonically increasing tick counter driven by the machine's timer
//! interrupt. Each tick runs the scheduler's accounting, sweeps the sleep
//! list when a deadline could have arrived, and performs any preemption
//! the handler latched once the handler has unwound.

use core::sync::atomic::{AtomicI64, Ordering};

use crate::kern::sched::Scheduler;

/// Timer interrupts per second.
pub const TIMER_FREQ: i64 = 100;

/// The global tick counter.
#[derive(Debug, Default)]
pub struct Timer {
    ticks: AtomicI64,
}

impl Timer {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicI64::new(0),
        }
    }

    /// Ticks since boot.
    pub fn ticks(&self) -> i64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Ticks elapsed since `then`.
    pub fn elapsed(&self, then: i64) -> i64 {
        self.ticks() - then
    }

    /// One timer interrupt: bump the counter, account the tick, wake due
    /// sleepers, then honor a latched yield. This is the only external
    /// handler in the core.
    pub fn interrupt(&self, sched: &Scheduler) {
        let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;

        let old = sched.intr.disable();
        sched.intr.enter_external();

        sched.note_tick();
        if now >= sched.next_wakeup_tick() {
            sched.wake_sweep(now);
        }

        let wants_yield = sched.intr.leave_external();
        sched.intr.set_level(old);

        if wants_yield {
            sched.yield_now();
        }
    }

    /// Put the running thread to sleep for `ticks` timer ticks.
    pub fn sleep(&self, ticks: i64, sched: &Scheduler) {
        if ticks <= 0 {
            return;
        }
        sched.sleep_until(self.ticks() + ticks);
    }

    /// Convert milliseconds to ticks, rounding up.
    pub const fn ms_to_ticks(ms: i64) -> i64 {
        (ms * TIMER_FREQ + 999) / 1000
    }
}
