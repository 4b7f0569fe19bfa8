//! Thread record
//!
//! A thread owns a single-page kernel stack; the descriptor sits at the
//! bottom of that page with a sentinel word that is checked on every
//! `current()` so a stack overrun is caught before it walks into the
//! scheduler's state. Scheduling runs on the effective priority, which is
//! the base priority lifted by whatever the thread's donors currently
//! carry.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use spin::Mutex;

use crate::error::{KernError, Result};
use crate::kern::sync::{Lock, Semaphore};
use crate::palloc::{KPage, PagePool};
use crate::types::{Tid, PAGE_SIZE};
use crate::vm::map::AddressSpace;

/// Sentinel stored in every thread descriptor; a corrupted value means
/// the kernel stack grew down into the descriptor.
pub const THREAD_MAGIC: u64 = 0xcd6a_bf4b;

/// Pages backing one file-descriptor table.
pub const FDT_PAGES: usize = 2;

/// Thread priority levels
pub mod priority {
    /// Minimum priority
    pub const MIN: i32 = 0;
    /// Default priority
    pub const DEFAULT: i32 = 31;
    /// Maximum priority
    pub const MAX: i32 = 63;
}

/// Thread life-cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// On the CPU.
    Running,
    /// On the ready list.
    Ready,
    /// Off both; waiting for an unblock.
    Blocked,
    /// Exited; descriptor queued for reclamation.
    Dying,
}

/// Thread entry point, run once the thread is first dispatched.
pub type ThreadEntry = Box<dyn FnOnce() + Send>;

// ============================================================================
// Thread Structure
// ============================================================================

/// A kernel thread.
pub struct Thread {
    /// Thread identifier
    pub tid: Tid,

    /// Fixed-length name
    name: heapless::String<16>,

    /// Stack-overflow sentinel
    magic: u64,

    /// Life-cycle state
    status: Mutex<ThreadStatus>,

    /// Priority as set by the thread itself
    base_priority: AtomicI32,

    /// Priority the scheduler uses; base lifted by donations
    priority: AtomicI32,

    /// Lock this thread is blocked on, if any
    waiting_on: Mutex<Option<Weak<Lock>>>,

    /// Threads donating their priority to this one
    donors: Mutex<Vec<Arc<Thread>>>,

    /// Absolute tick to wake at; valid only while on the sleep list
    pub(crate) wakeup_tick: AtomicI64,

    // === Lineage ===
    parent: Mutex<Option<Weak<Thread>>>,
    children: Mutex<Vec<Arc<Thread>>>,

    /// Raised by the child once a fork has copied its state.
    pub fork_done: Semaphore,
    /// Raised at exit for a parent blocked in wait.
    pub wait_done: Semaphore,
    /// Raised by the parent once it has collected the exit status.
    pub free_done: Semaphore,

    // === Address space and files ===
    space: Mutex<Option<Arc<AddressSpace>>>,
    files: Mutex<Option<FileTable>>,

    // === Execution ===
    entry: Mutex<Option<ThreadEntry>>,

    /// The kernel stack page this descriptor lives in. The bootstrap and
    /// idle threads run on the loader's stack and carry none.
    pub(crate) stack_page: Mutex<Option<KPage>>,
}

impl Thread {
    pub(crate) fn new(
        tid: Tid,
        name: &str,
        pri: i32,
        stack_page: Option<KPage>,
    ) -> Arc<Thread> {
        debug_assert!((priority::MIN..=priority::MAX).contains(&pri));
        Arc::new(Thread {
            tid,
            name: truncated_name(name),
            magic: THREAD_MAGIC,
            status: Mutex::new(ThreadStatus::Blocked),
            base_priority: AtomicI32::new(pri),
            priority: AtomicI32::new(pri),
            waiting_on: Mutex::new(None),
            donors: Mutex::new(Vec::new()),
            wakeup_tick: AtomicI64::new(0),
            parent: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            fork_done: Semaphore::new(0),
            wait_done: Semaphore::new(0),
            free_done: Semaphore::new(0),
            space: Mutex::new(None),
            files: Mutex::new(None),
            entry: Mutex::new(None),
            stack_page: Mutex::new(stack_page),
        })
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Validate the stack sentinel. Corruption is fatal.
    pub fn check_magic(&self) {
        assert!(
            self.magic == THREAD_MAGIC,
            "{} (tid {})",
            KernError::StackOverflowDetected,
            self.tid
        );
    }

    // === Status ===

    pub fn status(&self) -> ThreadStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        *self.status.lock() = status;
    }

    // === Priority ===

    /// Effective priority: what the scheduler orders by.
    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn base_priority(&self) -> i32 {
        self.base_priority.load(Ordering::Acquire)
    }

    pub(crate) fn set_base_priority(&self, pri: i32) {
        self.base_priority.store(pri, Ordering::Release);
    }

    pub(crate) fn set_effective_priority(&self, pri: i32) {
        self.priority.store(pri, Ordering::Release);
    }

    /// Recompute the effective priority from the base priority and the
    /// donor set. Idempotent for an unchanged donor set.
    pub fn refresh_priority(&self) {
        let mut eff = self.base_priority();
        for donor in self.donors.lock().iter() {
            eff = eff.max(donor.priority());
        }
        self.set_effective_priority(eff);
    }

    // === Donation graph ===

    pub(crate) fn waiting_on(&self) -> Option<Arc<Lock>> {
        self.waiting_on.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_waiting_on(&self, lock: Option<Weak<Lock>>) {
        *self.waiting_on.lock() = lock;
    }

    pub(crate) fn is_waiting_on(&self, lock: &Arc<Lock>) -> bool {
        self.waiting_on
            .lock()
            .as_ref()
            .is_some_and(|w| w.as_ptr() == Arc::as_ptr(lock))
    }

    pub(crate) fn add_donor(&self, donor: Arc<Thread>) {
        let mut donors = self.donors.lock();
        if !donors.iter().any(|d| Arc::ptr_eq(d, &donor)) {
            donors.push(donor);
        }
    }

    /// Drop every donor that is blocked on `lock`; the others stay.
    pub(crate) fn remove_donors_for(&self, lock: &Arc<Lock>) {
        self.donors.lock().retain(|d| !d.is_waiting_on(lock));
    }

    pub fn donor_count(&self) -> usize {
        self.donors.lock().len()
    }

    // === Lineage ===

    pub fn parent(&self) -> Option<Arc<Thread>> {
        self.parent.lock().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Thread>) {
        *self.parent.lock() = Some(Arc::downgrade(parent));
    }

    pub(crate) fn add_child(&self, child: Arc<Thread>) {
        self.children.lock().push(child);
    }

    pub fn children(&self) -> Vec<Arc<Thread>> {
        self.children.lock().clone()
    }

    // === Address space and files ===

    pub fn space(&self) -> Option<Arc<AddressSpace>> {
        self.space.lock().clone()
    }

    pub fn set_space(&self, space: Option<Arc<AddressSpace>>) {
        *self.space.lock() = space;
    }

    pub fn with_files<R>(&self, f: impl FnOnce(&mut FileTable) -> R) -> Option<R> {
        self.files.lock().as_mut().map(f)
    }

    pub(crate) fn install_files(&self, files: FileTable) {
        *self.files.lock() = Some(files);
    }

    pub(crate) fn take_files(&self) -> Option<FileTable> {
        self.files.lock().take()
    }

    // === Execution ===

    pub(crate) fn set_entry(&self, entry: ThreadEntry) {
        *self.entry.lock() = Some(entry);
    }

    /// Hand out the entry point; a hardware launcher runs it exactly once
    /// on first dispatch.
    pub fn take_entry(&self) -> Option<ThreadEntry> {
        self.entry.lock().take()
    }
}

fn truncated_name(s: &str) -> heapless::String<16> {
    let mut name = heapless::String::new();
    for c in s.chars() {
        if name.push(c).is_err() {
            break;
        }
    }
    name
}

// ============================================================================
// File Descriptor Table
// ============================================================================

/// Slot in a file-descriptor table.
pub enum FdEntry {
    /// Reserved descriptor 0.
    Stdin,
    /// Reserved descriptor 1.
    Stdout,
    /// An open file.
    Open(Box<dyn crate::fs::Vnode>),
}

/// Dense per-thread descriptor table. The table's storage is accounted as
/// kernel-pool pages so descriptor tables compete with thread stacks.
pub struct FileTable {
    slots: Vec<Option<FdEntry>>,
    next_fd: usize,
    max_fd: usize,
    _pages: Vec<KPage>,
}

impl FileTable {
    /// Descriptors per table.
    pub const CAPACITY: usize = FDT_PAGES * PAGE_SIZE / core::mem::size_of::<usize>();

    pub(crate) fn new(pool: &Arc<PagePool>) -> Result<FileTable> {
        let pages = pool.alloc_many(FDT_PAGES)?;
        let mut slots: Vec<Option<FdEntry>> = Vec::with_capacity(Self::CAPACITY);
        slots.resize_with(Self::CAPACITY, || None);
        slots[0] = Some(FdEntry::Stdin);
        slots[1] = Some(FdEntry::Stdout);
        Ok(FileTable {
            slots,
            next_fd: 2,
            max_fd: 1,
            _pages: pages,
        })
    }

    /// Install an open file in the lowest free slot at or above 2.
    pub fn install(&mut self, file: Box<dyn crate::fs::Vnode>) -> Result<usize> {
        let start = self.next_fd.max(2);
        let fd = (start..Self::CAPACITY)
            .chain(2..start)
            .find(|&i| self.slots[i].is_none())
            .ok_or(KernError::AllocationFailure)?;
        self.slots[fd] = Some(FdEntry::Open(file));
        self.next_fd = fd + 1;
        self.max_fd = self.max_fd.max(fd);
        Ok(fd)
    }

    /// Close a descriptor. Descriptors 0 and 1 cannot be closed.
    pub fn close(&mut self, fd: usize) -> Result<()> {
        if fd < 2 || fd >= Self::CAPACITY {
            return Err(KernError::InvalidArgument("fd"));
        }
        match self.slots[fd].take() {
            Some(_) => {
                self.next_fd = self.next_fd.min(fd);
                Ok(())
            }
            None => Err(KernError::InvalidArgument("fd")),
        }
    }

    pub fn get_mut(&mut self, fd: usize) -> Option<&mut FdEntry> {
        self.slots.get_mut(fd).and_then(|s| s.as_mut())
    }

    /// Highest descriptor ever handed out.
    pub fn max_fd(&self) -> usize {
        self.max_fd
    }

    /// Open descriptors, including the two reserved slots.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
