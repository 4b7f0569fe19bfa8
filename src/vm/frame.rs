//! Frame table and eviction
//!
//! Every frame currently lent to a user page sits in one global table
//! slot, owning the frame's contents and a handle to the page record that
//! owns the frame. When the user pool runs dry, a second-chance clock
//! walks the table: a frame whose page was accessed since the last visit
//! gets its bit cleared and a reprieve; the first unaccessed frame is
//! written out to its backing store and handed to the caller. The cursor
//! survives frame removal because it indexes a stable slot array.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernError, Result};
use crate::mmu::FrameId;
use crate::palloc::KPage;
use crate::vm::page::Page;
use crate::vm::Vm;

/// One occupied frame: the contents and the owning page record.
pub struct FrameSlot {
    pub page: Arc<Mutex<Page>>,
    pub kpage: KPage,
}

/// The global table of occupied frames.
pub struct FrameTable {
    slots: Mutex<Vec<Option<FrameSlot>>>,
    clock: Mutex<usize>,
}

impl FrameTable {
    pub fn new() -> FrameTable {
        FrameTable {
            slots: Mutex::new(Vec::new()),
            clock: Mutex::new(0),
        }
    }

    /// Frames currently lent out.
    pub fn in_use(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Bind a frame to its owning page record.
    pub(crate) fn install(&self, page: Arc<Mutex<Page>>, kpage: KPage) -> FrameId {
        let mut slots = self.slots.lock();
        let slot = FrameSlot { page, kpage };
        match slots.iter().position(|s| s.is_none()) {
            Some(i) => {
                slots[i] = Some(slot);
                FrameId(i as u32)
            }
            None => {
                slots.push(Some(slot));
                FrameId((slots.len() - 1) as u32)
            }
        }
    }

    /// Unbind a frame, handing ownership of contents back to the caller.
    pub(crate) fn take(&self, id: FrameId) -> Option<FrameSlot> {
        self.slots.lock().get_mut(id.0 as usize)?.take()
    }

    /// Read access to a resident frame's contents.
    pub fn with_bytes<R>(&self, id: FrameId, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let slots = self.slots.lock();
        slots
            .get(id.0 as usize)?
            .as_ref()
            .map(|s| f(s.kpage.bytes()))
    }

    /// Write access to a resident frame's contents.
    pub fn with_bytes_mut<R>(&self, id: FrameId, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut slots = self.slots.lock();
        slots
            .get_mut(id.0 as usize)?
            .as_mut()
            .map(|s| f(s.kpage.bytes_mut()))
    }

    /// Pick a victim with the second-chance clock, push it out to its
    /// backing store, and return its now-free frame. Pages mid-claim are
    /// skipped; their records are locked.
    pub(crate) fn evict(&self, vm: &Vm) -> Result<KPage> {
        let mut slots = self.slots.lock();
        let len = slots.len();
        if len == 0 {
            return Err(KernError::AllocationFailure);
        }

        let mut cursor = *self.clock.lock();
        // Two revolutions: the first may only be clearing accessed bits.
        for _ in 0..(2 * len + 1) {
            let i = cursor % len;
            cursor += 1;

            let page_arc = match &slots[i] {
                Some(slot) => slot.page.clone(),
                None => continue,
            };
            let mut pg = match page_arc.try_lock() {
                Some(guard) => guard,
                None => continue,
            };

            if pg.pml4.is_accessed(pg.va) {
                // Reprieve: clear the bit and move on.
                pg.pml4.set_accessed(pg.va, false);
                continue;
            }

            // Victim found.
            let mut slot = slots[i].take().expect("victim slot vanished");
            *self.clock.lock() = cursor;
            drop(slots);

            log::debug!("evicting page {} from frame {}", pg.va, i);
            if let Err(e) = pg.swap_out(vm, slot.kpage.bytes_mut()) {
                log::warn!("write-back of page {} failed during eviction: {}", pg.va, e);
            }
            pg.pml4.unmap(pg.va);
            pg.frame = None;
            return Ok(slot.kpage);
        }

        // Every frame is pinned by an in-flight claim.
        Err(KernError::AllocationFailure)
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
