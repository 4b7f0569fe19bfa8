//! Anonymous pages
//!
//! Memory with no file behind it: stacks, heaps, zero pages. Contents
//! live in the frame while resident and in a swap slot after eviction. A
//! page that has never been evicted has no slot and reads as zeros on its
//! first claim.

use crate::error::Result;
use crate::vm::Vm;

/// Backing state of one anonymous page.
pub struct AnonBacking {
    slot: Option<usize>,
}

impl AnonBacking {
    pub fn new() -> AnonBacking {
        AnonBacking { slot: None }
    }

    /// Swap slot currently holding the page, if evicted.
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    /// Load the page: read back the swap slot and release it, or
    /// zero-fill on the first claim.
    pub(crate) fn swap_in(&mut self, vm: &Vm, buf: &mut [u8]) -> Result<()> {
        match self.slot.take() {
            Some(slot) => {
                vm.swap.read_page(slot, buf)?;
                vm.swap.release(slot);
            }
            None => buf.fill(0),
        }
        Ok(())
    }

    /// Evict the page into a fresh swap slot. Running out of swap is
    /// fatal in this kernel.
    pub(crate) fn swap_out(&mut self, vm: &Vm, buf: &mut [u8]) -> Result<()> {
        let slot = match vm.swap.alloc() {
            Ok(slot) => slot,
            Err(e) => {
                log::error!("swap exhausted: {} slots in use", vm.swap.used());
                panic!("{}", e);
            }
        };
        vm.swap.write_page(slot, buf)?;
        self.slot = Some(slot);
        log::trace!("anon page swapped out to slot {}", slot);
        Ok(())
    }

    /// Drop the page, returning its slot if it still owns one.
    pub(crate) fn destroy(&mut self, vm: &Vm) {
        if let Some(slot) = self.slot.take() {
            vm.swap.release(slot);
        }
    }
}

impl Default for AnonBacking {
    fn default() -> Self {
        Self::new()
    }
}
