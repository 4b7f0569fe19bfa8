//! File-backed pages and memory mapping
//!
//! A file page mirrors `valid` bytes of an underlying file starting at
//! `ofs`; the tail of the page past `valid` reads as zeros and is never
//! written back. Each page carries its own reopened handle so destroying
//! pages independently is safe. Eviction and destruction write the page
//! back only when the hardware dirty bit says user stores landed on it.

use alloc::boxed::Box;

use crate::error::{KernError, Result};
use crate::fs::Vnode;
use crate::mmu::Pml4;
use crate::types::VirtAddr;

/// Backing state of one file-backed page.
pub struct FileBacking {
    vnode: Box<dyn Vnode>,
    ofs: u64,
    valid: usize,
}

impl FileBacking {
    pub fn new(vnode: Box<dyn Vnode>, ofs: u64, valid: usize) -> FileBacking {
        FileBacking { vnode, ofs, valid }
    }

    /// File offset of the page.
    pub fn ofs(&self) -> u64 {
        self.ofs
    }

    /// Bytes of the page that mirror the file.
    pub fn valid(&self) -> usize {
        self.valid
    }

    /// Load the page: positioned read of the valid range, zeros beyond.
    pub(crate) fn swap_in(&mut self, buf: &mut [u8]) -> Result<()> {
        self.vnode.seek(self.ofs);
        let n = self.vnode.read(&mut buf[..self.valid])?;
        buf[n..].fill(0);
        Ok(())
    }

    /// Write the valid range back if the page was dirtied, then mark it
    /// clean. Nothing goes to swap; the file itself is the backing.
    pub(crate) fn swap_out(&mut self, va: VirtAddr, pml4: &Pml4, buf: &mut [u8]) -> Result<()> {
        if pml4.is_dirty(va) {
            self.write_back(&buf[..self.valid])?;
            pml4.set_dirty(va, false);
        }
        Ok(())
    }

    /// Tear down the page: write back if dirty, then close the handle.
    /// A failed write-back is logged and the mapping is dropped anyway.
    pub(crate) fn destroy(&mut self, va: VirtAddr, pml4: &Pml4, resident: Option<&[u8]>) {
        if let Some(bytes) = resident {
            if pml4.is_dirty(va) {
                if let Err(e) = self.write_back(&bytes[..self.valid]) {
                    log::warn!("write-back of page {} failed: {}", va, e);
                }
            }
        }
        // The handle closes when the backing drops.
    }

    fn write_back(&mut self, bytes: &[u8]) -> Result<()> {
        self.vnode.seek(self.ofs);
        let n = self.vnode.write(bytes)?;
        if n != bytes.len() {
            return Err(KernError::IoFailure);
        }
        Ok(())
    }
}
