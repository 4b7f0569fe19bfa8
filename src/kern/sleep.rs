//! Timed sleep service
//!
//! Threads park here until an absolute tick. The list is unsorted; the
//! wake sweep walks it once per invocation, unblocking everything whose
//! deadline has arrived and re-deriving the earliest pending deadline so
//! the timer can skip the sweep entirely on quiet ticks.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, Ordering};
use spin::Mutex;

use crate::kern::interrupt::IntrLevel;
use crate::kern::sched::Scheduler;
use crate::kern::thread::Thread;

/// The sleeping-thread list plus the earliest pending wakeup tick.
pub struct SleepQueue {
    sleepers: Mutex<Vec<Arc<Thread>>>,
    next_wakeup: AtomicI64,
}

impl SleepQueue {
    pub fn new() -> Self {
        Self {
            sleepers: Mutex::new(Vec::new()),
            next_wakeup: AtomicI64::new(i64::MAX),
        }
    }

    /// Earliest pending wakeup tick; `i64::MAX` when nobody sleeps.
    pub fn next_wakeup(&self) -> i64 {
        self.next_wakeup.load(Ordering::Acquire)
    }

    fn note_deadline(&self, tick: i64) {
        self.next_wakeup.fetch_min(tick, Ordering::AcqRel);
    }

    /// Number of sleeping threads.
    pub fn len(&self) -> usize {
        self.sleepers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sleepers.lock().is_empty()
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Block the running thread until the given absolute tick. The idle
    /// thread must never sleep.
    pub fn sleep_until(&self, wakeup_tick: i64) {
        assert!(!self.intr.is_external(), "sleep from interrupt context");
        let old = self.intr.disable();

        let cur = self.current();
        assert!(
            !Arc::ptr_eq(&cur, &self.idle_thread()),
            "idle thread cannot sleep"
        );

        cur.wakeup_tick.store(wakeup_tick, Ordering::Release);
        self.sleep.sleepers.lock().push(cur);
        self.sleep.note_deadline(wakeup_tick);
        self.block();

        self.intr.set_level(old);
    }

    /// Earliest pending wakeup tick.
    pub fn next_wakeup_tick(&self) -> i64 {
        self.sleep.next_wakeup()
    }

    /// Wake every sleeper whose deadline is at or before `now`. Runs from
    /// the timer's external handler with interrupts off. Latches a yield
    /// when a woken thread outranks the running one.
    pub(crate) fn wake_sweep(&self, now: i64) {
        assert_eq!(self.intr.level(), IntrLevel::Off);

        self.sleep.next_wakeup.store(i64::MAX, Ordering::Release);

        let mut due: Vec<Arc<Thread>> = Vec::new();
        {
            let mut sleepers = self.sleep.sleepers.lock();
            let mut i = 0;
            while i < sleepers.len() {
                let tick = sleepers[i].wakeup_tick.load(Ordering::Acquire);
                if tick <= now {
                    due.push(sleepers.swap_remove(i));
                } else {
                    self.sleep.note_deadline(tick);
                    i += 1;
                }
            }
        }

        let cur_priority = self.current().priority();
        for t in due {
            log::trace!("waking thread {} at tick {}", t.tid, now);
            self.unblock(&t);
            if self.intr.is_external() && t.priority() > cur_priority {
                self.intr.yield_on_return();
            }
        }
    }
}
