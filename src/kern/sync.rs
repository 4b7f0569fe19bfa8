//! Synchronization primitives
//!
//! A counting semaphore, a mutex lock layered on it with priority
//! donation, and a Mesa-style condition variable. Wakeups always pick the
//! waiter with the highest current effective priority, re-examined at
//! wake time because donations may have lifted a waiter while it slept.
//!
//! Because the context switch is opaque (and the software double
//! returns), a woken thread cannot run completion code of its own: the
//! waker finishes the transition on its behalf. Semaphore posts hand the
//! count straight to the chosen waiter, a lock release installs the next
//! holder and re-homes the remaining waiters' donation edges onto it,
//! and a condition-variable signal re-enqueues the woken thread on the
//! lock itself.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::kern::sched::Scheduler;
use crate::kern::thread::Thread;

/// Bound on the lock-holder chain walked by a donation.
pub const DONATE_MAX_DEPTH: usize = 8;

// ============================================================================
// Semaphore
// ============================================================================

/// Counting semaphore with priority-aware wakeup.
pub struct Semaphore {
    value: AtomicU32,
    waiters: Mutex<Vec<Arc<Thread>>>,
}

impl Semaphore {
    pub const fn new(value: u32) -> Self {
        Self {
            value: AtomicU32::new(value),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::Acquire)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Decrement, blocking while the count is zero. A post while we are
    /// blocked hands the count to us directly.
    pub fn down(&self, sched: &Scheduler) {
        assert!(
            !sched.intr.is_external(),
            "semaphore down in interrupt context"
        );
        let old = sched.intr.disable();
        if self.try_take_value() {
            sched.intr.set_level(old);
            return;
        }
        self.waiters.lock().push(sched.current());
        sched.block();
        sched.intr.set_level(old);
    }

    /// Non-blocking decrement.
    pub fn try_down(&self, sched: &Scheduler) -> bool {
        let old = sched.intr.disable();
        let took = self.try_take_value();
        sched.intr.set_level(old);
        took
    }

    /// Increment, waking the highest-priority waiter if any. May preempt
    /// the caller; from an external handler it latches a yield instead.
    pub fn up(&self, sched: &Scheduler) {
        let woken = self.up_quiet(sched);
        if let Some(t) = woken {
            if sched.intr.is_external() {
                if t.priority() > sched.current().priority() {
                    sched.intr.yield_on_return();
                }
            } else {
                sched.preempt_if_outranked();
            }
        }
    }

    /// `up` without the preemption check. Used where the caller is about
    /// to schedule anyway.
    pub(crate) fn up_quiet(&self, sched: &Scheduler) -> Option<Arc<Thread>> {
        let old = sched.intr.disable();
        let woken = self.take_highest_waiter();
        match &woken {
            // Hand the count straight over; the waiter's down is done.
            Some(t) => sched.unblock(t),
            None => {
                self.value.fetch_add(1, Ordering::AcqRel);
            }
        }
        sched.intr.set_level(old);
        woken
    }

    fn try_take_value(&self) -> bool {
        let mut cur = self.value.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.value.compare_exchange(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Remove and return the waiter with the highest effective priority;
    /// the earliest-queued wins a tie. Priorities are re-read here, not
    /// at enqueue time, since donations may have moved them.
    fn take_highest_waiter(&self) -> Option<Arc<Thread>> {
        let mut waiters = self.waiters.lock();
        if waiters.is_empty() {
            return None;
        }
        let mut best = 0;
        for (i, t) in waiters.iter().enumerate().skip(1) {
            if t.priority() > waiters[best].priority() {
                best = i;
            }
        }
        Some(waiters.remove(best))
    }

    fn push_waiter(&self, t: Arc<Thread>) {
        self.waiters.lock().push(t);
    }

    fn waiters_snapshot(&self) -> Vec<Arc<Thread>> {
        self.waiters.lock().clone()
    }
}

// ============================================================================
// Lock
// ============================================================================

/// Mutex lock with priority donation, layered on a binary semaphore.
///
/// Invariant: `holder` is `None` exactly when the semaphore's value is 1.
pub struct Lock {
    holder: Mutex<Option<Arc<Thread>>>,
    sema: Semaphore,
}

impl Lock {
    pub fn new() -> Arc<Lock> {
        Arc::new(Lock {
            holder: Mutex::new(None),
            sema: Semaphore::new(1),
        })
    }

    pub fn holder(&self) -> Option<Arc<Thread>> {
        self.holder.lock().clone()
    }

    /// Value of the embedded semaphore.
    pub fn sema_value(&self) -> u32 {
        self.sema.value()
    }

    pub fn held_by_current(&self, sched: &Scheduler) -> bool {
        self.holder()
            .is_some_and(|h| Arc::ptr_eq(&h, &sched.current()))
    }

    /// Acquire the lock, donating our effective priority down the chain
    /// of holders while we wait.
    pub fn acquire(self: &Arc<Self>, sched: &Scheduler) {
        assert!(
            !sched.intr.is_external(),
            "lock acquire in interrupt context"
        );
        assert!(
            !self.held_by_current(sched),
            "recursive lock acquisition"
        );
        let old = sched.intr.disable();
        let cur = sched.current();

        let holder = self.holder();
        match holder {
            Some(holder) => {
                cur.set_waiting_on(Some(Arc::downgrade(self)));
                holder.add_donor(cur.clone());
                donate_chain(sched, &cur);
                self.sema.push_waiter(cur);
                sched.block();
                // The releaser installed us as holder before waking us.
            }
            None => {
                let took = self.sema.try_take_value();
                debug_assert!(took, "free lock with a zero semaphore");
                *self.holder.lock() = Some(cur);
            }
        }
        sched.intr.set_level(old);
    }

    /// Release the lock. Donors tied to this lock are dropped and our
    /// effective priority recomputed; if someone is waiting, the lock is
    /// handed straight to the highest-priority waiter.
    pub fn release(self: &Arc<Self>, sched: &Scheduler) {
        self.release_inner(sched);
        sched.preempt_if_outranked();
    }

    fn release_inner(self: &Arc<Self>, sched: &Scheduler) {
        let old = sched.intr.disable();
        let cur = sched.current();
        assert!(
            self.held_by_current(sched),
            "releasing a lock that is not held"
        );

        cur.remove_donors_for(self);
        cur.refresh_priority();

        match self.sema.take_highest_waiter() {
            Some(next_holder) => {
                next_holder.set_waiting_on(None);
                // The threads still queued behind this lock now donate to
                // its new holder.
                for w in self.sema.waiters_snapshot() {
                    next_holder.add_donor(w);
                }
                *self.holder.lock() = Some(next_holder.clone());
                next_holder.refresh_priority();
                sched.unblock(&next_holder);
            }
            None => {
                *self.holder.lock() = None;
                self.sema.value.fetch_add(1, Ordering::AcqRel);
            }
        }
        sched.intr.set_level(old);
    }

    /// Queue an already-blocked thread as if it had called `acquire`.
    /// Used by condition variables to reacquire on a woken waiter's
    /// behalf. Interrupts are off.
    fn enqueue_blocked(self: &Arc<Self>, sched: &Scheduler, t: Arc<Thread>) {
        match self.holder() {
            Some(holder) => {
                t.set_waiting_on(Some(Arc::downgrade(self)));
                holder.add_donor(t.clone());
                donate_chain(sched, &t);
                self.sema.push_waiter(t);
            }
            None => {
                let took = self.sema.try_take_value();
                debug_assert!(took, "free lock with a zero semaphore");
                *self.holder.lock() = Some(t.clone());
                sched.unblock(&t);
            }
        }
    }
}

/// Lift effective priorities along the chain of lock holders starting
/// from `from`, bounded at [`DONATE_MAX_DEPTH`]. Uses current effective
/// priorities, so an already-uplifted donor passes its uplift along.
fn donate_chain(sched: &Scheduler, from: &Arc<Thread>) {
    let mut cur = from.clone();
    for _ in 0..DONATE_MAX_DEPTH {
        let Some(lock) = cur.waiting_on() else { break };
        let Some(holder) = lock.holder() else { break };
        if holder.priority() < cur.priority() {
            holder.set_effective_priority(cur.priority());
            if holder.status() == crate::kern::thread::ThreadStatus::Ready {
                sched.requeue_ready(&holder);
            }
        }
        cur = holder;
    }
}

// ============================================================================
// Condition Variable
// ============================================================================

/// Mesa-style condition variable. `signal` wakes the waiter with the
/// highest effective priority and reacquires the monitor lock on its
/// behalf, so the woken thread resumes already holding the lock.
pub struct Condvar {
    waiters: Mutex<Vec<Arc<Thread>>>,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Atomically release `lock` and wait for a signal; the lock is held
    /// again when the wait returns.
    pub fn wait(&self, lock: &Arc<Lock>, sched: &Scheduler) {
        assert!(
            !sched.intr.is_external(),
            "condvar wait in interrupt context"
        );
        assert!(
            lock.held_by_current(sched),
            "condvar wait without the lock"
        );
        let old = sched.intr.disable();
        self.waiters.lock().push(sched.current());
        lock.release_inner(sched);
        sched.block();
        sched.intr.set_level(old);
    }

    /// Wake one waiter, if any. The caller must hold the lock.
    pub fn signal(&self, lock: &Arc<Lock>, sched: &Scheduler) {
        assert!(
            lock.held_by_current(sched),
            "condvar signal without the lock"
        );
        let old = sched.intr.disable();
        let woken = {
            let mut waiters = self.waiters.lock();
            if waiters.is_empty() {
                None
            } else {
                let mut best = 0;
                for (i, t) in waiters.iter().enumerate().skip(1) {
                    if t.priority() > waiters[best].priority() {
                        best = i;
                    }
                }
                Some(waiters.remove(best))
            }
        };
        if let Some(t) = woken {
            lock.enqueue_blocked(sched, t);
        }
        sched.intr.set_level(old);
    }

    /// Wake every waiter.
    pub fn broadcast(&self, lock: &Arc<Lock>, sched: &Scheduler) {
        while self.waiter_count() > 0 {
            self.signal(lock, sched);
        }
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
