//! Page subsystem
//!
//! Lazy user pages over a fixed frame pool: page records per address
//! space, a global frame table with second-chance eviction, a swap-slot
//! bitmap for anonymous pages, and write-back file mappings.

pub mod anon;
pub mod file;
pub mod frame;
pub mod map;
pub mod page;
pub mod swap;

pub use map::{AddressSpace, MmapRecord, STACK_GROWTH_WINDOW, STACK_LIMIT, USER_STACK_TOP};
pub use page::{Backing, BackingKind, Page, PageInit, PageKind};
pub use swap::SECTORS_PER_PAGE;

use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;

use crate::block::BlockDevice;
use crate::error::{KernError, Result};
use crate::palloc::{KPage, PagePool};

/// Counters for the whole page subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub frames_in_use: usize,
    pub free_user_pages: usize,
    pub swap_slots_used: usize,
    pub swap_slots_total: usize,
}

// ============================================================================
// Subsystem Root
// ============================================================================

/// Global page-subsystem state: the frame table, the swap table, the
/// user pool they draw from, and the active address space.
pub struct Vm {
    pub frames: frame::FrameTable,
    pub swap: swap::SwapTable,
    user_pool: Arc<PagePool>,
    active: Mutex<Option<Arc<AddressSpace>>>,
}

impl Vm {
    pub fn new(user_pool: Arc<PagePool>, swap_dev: Box<dyn BlockDevice>) -> Arc<Vm> {
        Arc::new(Vm {
            frames: frame::FrameTable::new(),
            swap: swap::SwapTable::new(swap_dev),
            user_pool,
            active: Mutex::new(None),
        })
    }

    pub fn user_pool(&self) -> &Arc<PagePool> {
        &self.user_pool
    }

    /// Get a frame's worth of memory for a claim, evicting a victim when
    /// the pool is dry.
    pub(crate) fn frame_page(&self) -> Result<KPage> {
        match self.user_pool.alloc() {
            Ok(page) => Ok(page),
            Err(KernError::AllocationFailure) => self.frames.evict(self),
            Err(e) => Err(e),
        }
    }

    /// Make `space` the address space the CPU translates through; `None`
    /// for a pure kernel thread. Called on every context switch.
    pub fn activate(&self, space: Option<Arc<AddressSpace>>) {
        *self.active.lock() = space;
    }

    /// The address space activated by the last switch.
    pub fn active(&self) -> Option<Arc<AddressSpace>> {
        self.active.lock().clone()
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            frames_in_use: self.frames.in_use(),
            free_user_pages: self.user_pool.free_pages(),
            swap_slots_used: self.swap.used(),
            swap_slots_total: self.swap.slot_count(),
        }
    }
}
