//! Page records
//!
//! One record per user virtual page, tracking what backs it and whether a
//! frame currently holds it. Backing state is a tagged variant so the
//! transfer operations dispatch on the tag: an uninitialized page carries
//! its initializer and target kind until the first claim upgrades it.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::error::Result;
use crate::mmu::{FrameId, Pml4};
use crate::types::VirtAddr;
use crate::vm::anon::AnonBacking;
use crate::vm::file::FileBacking;
use crate::vm::Vm;

/// First-claim initializer: runs with the record and the freshly
/// allocated frame's kernel-virtual contents, installs the concrete
/// backing, and reports success. Its captured payload is consumed by the
/// call (or by drop, if the page is destroyed unclaimed).
pub type PageInit = Box<dyn FnOnce(&mut Page, &mut [u8]) -> bool + Send>;

/// Target kind recorded in an uninitialized page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingKind {
    Anon,
    File,
}

/// Observable kind of a page record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Uninit,
    Anon,
    File,
}

/// What holds a page's contents when it is not resident.
pub enum Backing {
    /// Never claimed; the initializer runs on first claim.
    Uninit {
        target: BackingKind,
        init: Option<PageInit>,
    },
    /// Swap-backed anonymous memory.
    Anon(AnonBacking),
    /// A range of an underlying file.
    File(FileBacking),
}

// ============================================================================
// Page
// ============================================================================

/// Record of one user virtual page.
pub struct Page {
    /// Page-aligned user virtual address.
    pub va: VirtAddr,
    /// May user stores land here?
    pub writable: bool,
    /// Frame currently holding the contents, if resident.
    pub frame: Option<FrameId>,
    /// Backing store.
    pub backing: Backing,
    /// The owning address space's hardware table, for the dirty and
    /// accessed bits.
    pub(crate) pml4: Arc<Pml4>,
}

impl Page {
    pub(crate) fn new(
        va: VirtAddr,
        writable: bool,
        backing: Backing,
        pml4: Arc<Pml4>,
    ) -> Page {
        debug_assert!(va.is_page_aligned());
        Page {
            va,
            writable,
            frame: None,
            backing,
            pml4,
        }
    }

    pub fn kind(&self) -> PageKind {
        match self.backing {
            Backing::Uninit { .. } => PageKind::Uninit,
            Backing::Anon(_) => PageKind::Anon,
            Backing::File(_) => PageKind::File,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Fill `buf` from the backing store.
    pub(crate) fn swap_in(&mut self, vm: &Vm, buf: &mut [u8]) -> Result<()> {
        match &mut self.backing {
            Backing::Uninit { .. } => unreachable!("swap_in on an uninitialized page"),
            Backing::Anon(a) => a.swap_in(vm, buf),
            Backing::File(f) => f.swap_in(buf),
        }
    }

    /// Push `buf` out to the backing store ahead of losing the frame.
    pub(crate) fn swap_out(&mut self, vm: &Vm, buf: &mut [u8]) -> Result<()> {
        let pml4 = self.pml4.clone();
        let va = self.va;
        match &mut self.backing {
            Backing::Uninit { .. } => unreachable!("swap_out on an uninitialized page"),
            Backing::Anon(a) => a.swap_out(vm, buf),
            Backing::File(f) => f.swap_out(va, &pml4, buf),
        }
    }

    /// Release everything the backing holds. `resident` carries the
    /// frame contents when the page is still in memory, for write-back.
    pub(crate) fn destroy(&mut self, vm: &Vm, resident: Option<&[u8]>) {
        let pml4 = self.pml4.clone();
        let va = self.va;
        match &mut self.backing {
            // Dropping the initializer frees its captured payload.
            Backing::Uninit { init, .. } => drop(init.take()),
            Backing::Anon(a) => a.destroy(vm),
            Backing::File(f) => f.destroy(va, &pml4, resident),
        }
    }
}
