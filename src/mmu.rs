//! Hardware page-table double
//!
//! Architecture-independent view of one address space's page table. The
//! real machine's table walk, TLB, and CR3 load live behind this module;
//! the software rendition keeps a map from page-aligned virtual address
//! to a frame plus the present/writable/accessed/dirty bits, which is all
//! the page subsystem ever asks of the hardware.

use alloc::collections::BTreeMap;
use bitflags::bitflags;
use spin::Mutex;

use crate::error::{KernError, Result};
use crate::types::VirtAddr;

bitflags! {
    /// Page-fault error code pushed by the machine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Fault on a present page (rights violation, not a miss).
        const PRESENT = 1 << 0;
        /// Fault caused by a write access.
        const WRITE = 1 << 1;
        /// Fault raised from user mode.
        const USER = 1 << 2;
    }
}

/// Handle to a physical frame; index into the global frame table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

/// One installed translation.
#[derive(Debug, Clone, Copy)]
struct HwEntry {
    frame: FrameId,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

// ============================================================================
// Page Table
// ============================================================================

/// Software page table for one address space.
#[derive(Debug, Default)]
pub struct Pml4 {
    entries: Mutex<BTreeMap<u64, HwEntry>>,
}

impl Pml4 {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Install a translation. The page must not already be present.
    pub fn map(&self, va: VirtAddr, frame: FrameId, writable: bool) -> Result<()> {
        let va = va.page_down();
        let mut entries = self.entries.lock();
        if entries.contains_key(&va.0) {
            return Err(KernError::AlreadyMapped);
        }
        entries.insert(
            va.0,
            HwEntry {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        Ok(())
    }

    /// Remove a translation; returns the frame it pointed at, if any.
    pub fn unmap(&self, va: VirtAddr) -> Option<FrameId> {
        self.entries
            .lock()
            .remove(&va.page_down().0)
            .map(|e| e.frame)
    }

    /// Look up a present translation.
    pub fn lookup(&self, va: VirtAddr) -> Option<(FrameId, bool)> {
        self.entries
            .lock()
            .get(&va.page_down().0)
            .map(|e| (e.frame, e.writable))
    }

    pub fn is_mapped(&self, va: VirtAddr) -> bool {
        self.entries.lock().contains_key(&va.page_down().0)
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&va.page_down().0)
            .is_some_and(|e| e.dirty)
    }

    pub fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        if let Some(e) = self.entries.lock().get_mut(&va.page_down().0) {
            e.dirty = dirty;
        }
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.entries
            .lock()
            .get(&va.page_down().0)
            .is_some_and(|e| e.accessed)
    }

    pub fn set_accessed(&self, va: VirtAddr, accessed: bool) {
        if let Some(e) = self.entries.lock().get_mut(&va.page_down().0) {
            e.accessed = accessed;
        }
    }

    /// Record what the table walk would: an access sets the accessed bit
    /// and a store additionally sets the dirty bit.
    pub(crate) fn touch(&self, va: VirtAddr, write: bool) {
        if let Some(e) = self.entries.lock().get_mut(&va.page_down().0) {
            e.accessed = true;
            if write {
                e.dirty = true;
            }
        }
    }

    /// Number of present translations.
    pub fn mapped_count(&self) -> usize {
        self.entries.lock().len()
    }
}
