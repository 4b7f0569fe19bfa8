//! Scheduler
//!
//! Single-CPU preemptive priority scheduler. The ready list is kept
//! sorted by effective priority, ties in FIFO order; the head is always
//! the next thread to run. Threads that exit park on a destruction queue
//! and their stack pages are reclaimed at the next scheduling pass, since
//! a dying thread is still standing on its own stack when it schedules
//! away.
//!
//! The hardware handoff is opaque behind [`Launch`]. On the real machine
//! it restores the incoming thread's frame and never returns; the
//! [`SoftSwitch`] double records the handoff and returns so hosted tests
//! can keep driving the executive. All blocking primitives are written so
//! that the waker completes the woken thread's state transition, which is
//! what makes the soft handoff sound.

use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::error::{KernError, Result};
use crate::kern::interrupt::{IntrLevel, IntrState};
use crate::kern::sleep::SleepQueue;
use crate::kern::thread::{priority, FileTable, Thread, ThreadStatus};
use crate::palloc::PagePool;
use crate::types::Tid;
use crate::vm::Vm;

/// Timer ticks each thread gets before preemption.
pub const TIME_SLICE: u32 = 4;

// ============================================================================
// Context Switch Seam
// ============================================================================

/// The context-switch primitive.
pub trait Launch: Send + Sync {
    /// Hand the CPU from `prev` to `next`. A hardware implementation does
    /// not return; the software double must.
    fn switch(&self, prev: &Arc<Thread>, next: &Arc<Thread>);
}

/// Cooperative stand-in for the context switch: the handoff is recorded
/// by the scheduler and control returns to the driver.
pub struct SoftSwitch;

impl Launch for SoftSwitch {
    fn switch(&self, _prev: &Arc<Thread>, _next: &Arc<Thread>) {}
}

// ============================================================================
// Statistics
// ============================================================================

/// Tick accounting by thread class, plus context switches.
#[derive(Debug, Default)]
pub struct SchedStats {
    pub idle_ticks: AtomicI64,
    pub kernel_ticks: AtomicI64,
    pub user_ticks: AtomicI64,
    pub context_switches: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedSnapshot {
    pub idle_ticks: i64,
    pub kernel_ticks: i64,
    pub user_ticks: i64,
    pub context_switches: u64,
}

// ============================================================================
// Scheduler
// ============================================================================

/// The executive: every scheduler queue and the interrupt discipline that
/// guards them.
pub struct Scheduler {
    pub intr: IntrState,
    launcher: Box<dyn Launch>,

    current: Mutex<Arc<Thread>>,
    initial: Arc<Thread>,
    idle: Arc<Thread>,

    /// Ready threads, effective priority descending, FIFO within a
    /// priority.
    ready: Mutex<VecDeque<Arc<Thread>>>,

    /// Sleeping threads (see `kern::sleep`).
    pub(crate) sleep: SleepQueue,

    /// Exited threads awaiting stack reclamation.
    reap: Mutex<Vec<Arc<Thread>>>,

    /// Every live thread by tid.
    all: Mutex<BTreeMap<u64, Arc<Thread>>>,

    next_tid: AtomicU64,

    /// Ticks consumed by the running thread's current slice.
    slice_ticks: AtomicU32,

    pub stats: SchedStats,

    kpool: Arc<PagePool>,

    /// Page subsystem handle, for address-space activation on switch.
    vm: Once<Arc<Vm>>,
}

impl Scheduler {
    /// Build the executive, transforming the caller into the initial
    /// thread and preparing the idle thread. Interrupts stay off until
    /// [`Scheduler::start`].
    pub fn new(kpool: Arc<PagePool>, launcher: Box<dyn Launch>) -> Scheduler {
        let next_tid = AtomicU64::new(1);
        let initial = Thread::new(
            Tid(next_tid.fetch_add(1, Ordering::Relaxed)),
            "main",
            priority::DEFAULT,
            None,
        );
        initial.set_status(ThreadStatus::Running);

        let idle = Thread::new(
            Tid(next_tid.fetch_add(1, Ordering::Relaxed)),
            "idle",
            priority::MIN,
            None,
        );

        let mut all = BTreeMap::new();
        all.insert(initial.tid.0, initial.clone());
        all.insert(idle.tid.0, idle.clone());

        Scheduler {
            intr: IntrState::new(),
            launcher,
            current: Mutex::new(initial.clone()),
            initial,
            idle,
            ready: Mutex::new(VecDeque::new()),
            sleep: SleepQueue::new(),
            reap: Mutex::new(Vec::new()),
            all: Mutex::new(all),
            next_tid,
            slice_ticks: AtomicU32::new(0),
            stats: SchedStats::default(),
            kpool,
            vm: Once::new(),
        }
    }

    /// Start preemptive scheduling by enabling interrupts.
    pub fn start(&self) {
        self.intr.enable();
    }

    pub(crate) fn attach_vm(&self, vm: Arc<Vm>) {
        self.vm.call_once(|| vm);
    }

    // === Current thread ===

    /// The running thread, with the stack sentinel validated.
    pub fn current(&self) -> Arc<Thread> {
        let t = self.current.lock().clone();
        t.check_magic();
        assert_eq!(t.status(), ThreadStatus::Running);
        t
    }

    pub fn current_tid(&self) -> Tid {
        self.current().tid
    }

    pub fn current_name(&self) -> heapless::String<16> {
        let t = self.current();
        let mut name = heapless::String::new();
        let _ = name.push_str(t.name());
        name
    }

    pub fn idle_thread(&self) -> Arc<Thread> {
        self.idle.clone()
    }

    /// Look up a live thread by tid.
    pub fn find(&self, tid: Tid) -> Option<Arc<Thread>> {
        self.all.lock().get(&tid.0).cloned()
    }

    /// Snapshot of every live thread.
    pub fn threads(&self) -> Vec<Arc<Thread>> {
        self.all.lock().values().cloned().collect()
    }

    /// Snapshot of the ready list, head first.
    pub fn ready_threads(&self) -> Vec<Arc<Thread>> {
        self.ready.lock().iter().cloned().collect()
    }

    // === Creation ===

    /// Create a thread and make it ready. The entry closure runs when a
    /// hardware launcher first dispatches the thread. May preempt the
    /// caller if the new thread outranks it.
    pub fn create(
        &self,
        name: &str,
        pri: i32,
        entry: impl FnOnce() + Send + 'static,
    ) -> Result<Tid> {
        if self.intr.is_external() {
            // Thread creation allocates; handlers may not.
            return Err(KernError::WrongInterruptContext);
        }
        if !(priority::MIN..=priority::MAX).contains(&pri) {
            return Err(KernError::InvalidArgument("priority"));
        }

        // All-or-nothing resource grab: a failure here leaves no trace.
        let stack_page = self.kpool.alloc()?;
        let files = FileTable::new(&self.kpool)?;

        let tid = Tid(self.next_tid.fetch_add(1, Ordering::Relaxed));
        let t = Thread::new(tid, name, pri, Some(stack_page));
        t.install_files(files);
        t.set_entry(Box::new(entry));

        let parent = self.current();
        t.set_parent(&parent);
        parent.add_child(t.clone());

        self.all.lock().insert(tid.0, t.clone());
        log::debug!("created thread {} \"{}\" pri {}", tid, t.name(), pri);

        self.unblock(&t);
        self.preempt_if_outranked();
        Ok(tid)
    }

    // === State transitions ===

    /// Block the running thread. Interrupts must be off and we must not
    /// be in an external handler. The caller has already queued the
    /// thread wherever its wakeup will come from.
    pub fn block(&self) {
        assert!(!self.intr.is_external(), "block from interrupt context");
        assert_eq!(
            self.intr.level(),
            IntrLevel::Off,
            "block with interrupts enabled"
        );
        self.reschedule(ThreadStatus::Blocked);
    }

    /// Move a blocked thread to the ready list. Does not preempt the
    /// caller; callers decide whether to follow with
    /// [`Scheduler::preempt_if_outranked`].
    pub fn unblock(&self, t: &Arc<Thread>) {
        t.check_magic();
        let old = self.intr.disable();
        assert_eq!(
            t.status(),
            ThreadStatus::Blocked,
            "unblock of a thread that is not blocked"
        );
        self.ready_insert(t.clone());
        t.set_status(ThreadStatus::Ready);
        self.intr.set_level(old);
    }

    /// Yield the CPU, staying ready.
    pub fn yield_now(&self) {
        assert!(!self.intr.is_external(), "yield from interrupt context");
        let old = self.intr.disable();
        let cur = self.current.lock().clone();
        if !Arc::ptr_eq(&cur, &self.idle) {
            self.ready_insert(cur);
        }
        self.reschedule(ThreadStatus::Ready);
        self.intr.set_level(old);
    }

    /// Exit the running thread. Tears down the address space and file
    /// table, raises `wait_done` for the parent, and schedules away as
    /// dying; the descriptor's stack page is reclaimed at the next
    /// scheduling pass. With a hardware launcher this never returns.
    pub fn exit(&self) {
        assert!(!self.intr.is_external(), "exit from interrupt context");
        let cur = self.current();

        // Teardown runs with interrupts on: it may write back mmaps.
        cur.set_space(None);
        drop(cur.take_files());

        let old = self.intr.disable();
        // Wake a parent blocked in wait; the dying reschedule below picks
        // the highest-priority ready thread anyway, so no preempt check.
        cur.wait_done.up_quiet(self);
        self.reschedule(ThreadStatus::Dying);
        self.intr.set_level(old);
    }

    // === Priority ===

    /// Set the running thread's base priority and re-derive its
    /// effective priority from its donors. May yield if the head of the
    /// ready list now outranks us.
    pub fn set_priority(&self, pri: i32) -> Result<()> {
        if !(priority::MIN..=priority::MAX).contains(&pri) {
            return Err(KernError::InvalidArgument("priority"));
        }
        let old = self.intr.disable();
        let cur = self.current();
        cur.set_base_priority(pri);
        cur.refresh_priority();
        self.intr.set_level(old);
        self.preempt_if_outranked();
        Ok(())
    }

    /// The running thread's effective priority.
    pub fn get_priority(&self) -> i32 {
        self.current().priority()
    }

    /// Yield if the head of the ready list strictly outranks the running
    /// thread. A no-op in interrupt context; the tick path uses the
    /// yield-on-return latch instead.
    pub fn preempt_if_outranked(&self) {
        if self.intr.is_external() {
            return;
        }
        let old = self.intr.disable();
        let cur = self.current.lock().clone();
        let outranked = self
            .ready
            .lock()
            .front()
            .is_some_and(|head| head.priority() > cur.priority());
        self.intr.set_level(old);
        if outranked {
            self.yield_now();
        }
    }

    /// Reposition a ready thread after a donation changed its effective
    /// priority.
    pub(crate) fn requeue_ready(&self, t: &Arc<Thread>) {
        debug_assert_eq!(self.intr.level(), IntrLevel::Off);
        let mut ready = self.ready.lock();
        if let Some(i) = ready.iter().position(|r| Arc::ptr_eq(r, t)) {
            ready.remove(i);
            let pri = t.priority();
            let pos = ready
                .iter()
                .position(|r| r.priority() < pri)
                .unwrap_or(ready.len());
            ready.insert(pos, t.clone());
        }
    }

    // === Tick path ===

    /// Per-tick bookkeeping; runs in the timer's external handler.
    pub(crate) fn note_tick(&self) {
        let cur = self.current.lock().clone();
        if Arc::ptr_eq(&cur, &self.idle) {
            self.stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
        } else if cur.space().is_some() {
            self.stats.user_ticks.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.kernel_ticks.fetch_add(1, Ordering::Relaxed);
        }

        if self.slice_ticks.fetch_add(1, Ordering::Relaxed) + 1 >= TIME_SLICE {
            self.intr.yield_on_return();
        }
    }

    // === Core ===

    fn ready_insert(&self, t: Arc<Thread>) {
        let old = self.intr.disable();
        let mut ready = self.ready.lock();
        let pri = t.priority();
        // After every entry of greater or equal priority: FIFO ties.
        let pos = ready
            .iter()
            .position(|r| r.priority() < pri)
            .unwrap_or(ready.len());
        ready.insert(pos, t);
        drop(ready);
        self.intr.set_level(old);
    }

    /// Schedule away from the running thread, which transitions to
    /// `new_status`. Interrupts must be off.
    fn reschedule(&self, new_status: ThreadStatus) {
        assert_eq!(self.intr.level(), IntrLevel::Off);

        // Reclaim stacks of threads that died since the last pass.
        let victims: Vec<Arc<Thread>> = self.reap.lock().drain(..).collect();
        for v in victims {
            log::trace!("reaping thread {} \"{}\"", v.tid, v.name());
            v.stack_page.lock().take();
            self.all.lock().remove(&v.tid.0);
        }

        let prev = self.current.lock().clone();
        assert_eq!(prev.status(), ThreadStatus::Running);
        // The idle thread only ever leaves the CPU by blocking.
        if Arc::ptr_eq(&prev, &self.idle) {
            prev.set_status(ThreadStatus::Blocked);
        } else {
            prev.set_status(new_status);
        }

        let next = self
            .ready
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.idle.clone());
        next.set_status(ThreadStatus::Running);
        self.slice_ticks.store(0, Ordering::Relaxed);

        if let Some(vm) = self.vm.get() {
            vm.activate(next.space());
        }

        if !Arc::ptr_eq(&prev, &next) {
            if prev.status() == ThreadStatus::Dying && !Arc::ptr_eq(&prev, &self.initial) {
                self.reap.lock().push(prev.clone());
            }
            self.stats
                .context_switches
                .fetch_add(1, Ordering::Relaxed);
            *self.current.lock() = next.clone();
            self.launcher.switch(&prev, &next);
        }
    }

    // === Statistics ===

    pub fn stats_snapshot(&self) -> SchedSnapshot {
        SchedSnapshot {
            idle_ticks: self.stats.idle_ticks.load(Ordering::Relaxed),
            kernel_ticks: self.stats.kernel_ticks.load(Ordering::Relaxed),
            user_ticks: self.stats.user_ticks.load(Ordering::Relaxed),
            context_switches: self.stats.context_switches.load(Ordering::Relaxed),
        }
    }

    /// Log the tick counters, one line.
    pub fn log_stats(&self) {
        let s = self.stats_snapshot();
        log::info!(
            "thread: {} idle ticks, {} kernel ticks, {} user ticks",
            s.idle_ticks,
            s.kernel_ticks,
            s.user_ticks
        );
    }

    // === Multi-level feedback queue surface (not implemented) ===

    pub fn nice(&self) -> i32 {
        0
    }

    pub fn set_nice(&self, _nice: i32) {}

    pub fn load_avg(&self) -> i32 {
        0
    }

    pub fn recent_cpu(&self) -> i32 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> Scheduler {
        let s = Scheduler::new(PagePool::new("kernel", 32), Box::new(SoftSwitch));
        s.start();
        s
    }

    #[test]
    fn test_bootstrap_thread_running() {
        let s = sched();
        let cur = s.current();
        assert_eq!(cur.name(), "main");
        assert_eq!(cur.status(), ThreadStatus::Running);
        assert_eq!(cur.priority(), priority::DEFAULT);
    }

    #[test]
    fn test_create_lower_priority_does_not_preempt() {
        let s = sched();
        let main = s.current();
        let tid = s.create("lo", 5, || {}).unwrap();
        assert!(Arc::ptr_eq(&s.current(), &main));
        let lo = s.find(tid).unwrap();
        assert_eq!(lo.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_create_higher_priority_preempts() {
        let s = sched();
        let main = s.current();
        let tid = s.create("hi", 50, || {}).unwrap();
        assert_eq!(s.current_tid(), tid);
        assert_eq!(main.status(), ThreadStatus::Ready);
    }

    #[test]
    fn test_ready_list_sorted_fifo_ties() {
        let s = sched();
        s.set_priority(priority::MAX).unwrap();
        let a = s.create("a", 10, || {}).unwrap();
        let b = s.create("b", 30, || {}).unwrap();
        let c = s.create("c", 30, || {}).unwrap();
        let d = s.create("d", 20, || {}).unwrap();

        let tids: Vec<Tid> = s.ready_threads().iter().map(|t| t.tid).collect();
        assert_eq!(tids, alloc::vec![b, c, d, a]);
    }

    #[test]
    fn test_yield_round_robin_same_priority() {
        let s = sched();
        let main = s.current();
        let tid = s.create("peer", priority::DEFAULT, || {}).unwrap();

        // Same priority: no preemption on create.
        assert!(Arc::ptr_eq(&s.current(), &main));
        s.yield_now();
        assert_eq!(s.current_tid(), tid);
        s.yield_now();
        assert!(Arc::ptr_eq(&s.current(), &main));
    }

    #[test]
    fn test_yield_alone_keeps_running() {
        let s = sched();
        let main = s.current();
        s.yield_now();
        assert!(Arc::ptr_eq(&s.current(), &main));
        assert_eq!(main.status(), ThreadStatus::Running);
    }

    #[test]
    fn test_exit_reclaims_stack_on_next_pass() {
        let s = sched();
        let free_before = s.kpool.free_pages();
        let tid = s.create("hi", 50, || {}).unwrap();
        assert_eq!(s.current_tid(), tid);

        s.exit();
        // Back on the bootstrap thread; the dead thread is reaped at the
        // next scheduling pass.
        assert!(s.find(tid).is_some());
        s.yield_now();
        assert!(s.find(tid).is_none());
        assert_eq!(s.kpool.free_pages(), free_before);
    }

    #[test]
    fn test_create_fails_cleanly_when_pool_exhausted() {
        let s = Scheduler::new(PagePool::new("kernel", 2), Box::new(SoftSwitch));
        s.start();
        // Stack fits but the descriptor table does not.
        assert_eq!(
            s.create("x", 10, || {}),
            Err(KernError::AllocationFailure)
        );
        // No partial state: both pages back in the pool.
        assert_eq!(s.kpool.free_pages(), 2);
        assert!(s.ready_threads().is_empty());
    }

    #[test]
    fn test_set_priority_validates_range() {
        let s = sched();
        assert!(s.set_priority(64).is_err());
        assert!(s.set_priority(-1).is_err());
        s.set_priority(priority::MIN).unwrap();
        assert_eq!(s.get_priority(), priority::MIN);
    }

    #[test]
    fn test_exactly_one_running() {
        let s = sched();
        s.create("a", 50, || {}).unwrap();
        s.create("b", 40, || {}).unwrap();
        s.yield_now();
        let running = s
            .threads()
            .iter()
            .filter(|t| t.status() == ThreadStatus::Running)
            .count();
        assert_eq!(running, 1);
    }

    #[test]
    fn test_create_rejected_in_interrupt_context() {
        let s = sched();
        let old = s.intr.disable();
        s.intr.enter_external();
        assert_eq!(
            s.create("x", 10, || {}),
            Err(KernError::WrongInterruptContext)
        );
        s.intr.leave_external();
        s.intr.set_level(old);
    }

    #[test]
    fn test_mlfqs_surface_is_stubbed() {
        let s = sched();
        s.set_nice(5);
        assert_eq!(s.nice(), 0);
        assert_eq!(s.load_avg(), 0);
        assert_eq!(s.recent_cpu(), 0);
    }
}
