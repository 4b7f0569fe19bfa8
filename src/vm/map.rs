//! Address spaces
//!
//! The per-process side of the page subsystem: a registry mapping each
//! page-aligned user virtual address to its page record, the fault router
//! that populates pages on demand (including stack growth), the mmap
//! record list, and copy helpers that stand in for user-mode loads and
//! stores, faulting pages in and driving the hardware accessed and dirty
//! bits the way the machine would.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernError, Result};
use crate::fs::Vnode;
use crate::mmu::{FaultCode, Pml4};
use crate::types::{VirtAddr, PAGE_SIZE};
use crate::vm::file::FileBacking;
use crate::vm::page::{Backing, BackingKind, Page, PageInit};
use crate::vm::{anon::AnonBacking, Vm};

/// Upper bound on user stack growth.
pub const STACK_LIMIT: u64 = 1 << 20;

/// How far below the stack pointer a fault still counts as stack growth;
/// one push's worth.
pub const STACK_GROWTH_WINDOW: u64 = 8;

/// Top of the user stack region.
pub const USER_STACK_TOP: u64 = 0x4748_0000;

/// One mmap call: first page and last page of the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapRecord {
    pub start: VirtAddr,
    pub last: VirtAddr,
}

// ============================================================================
// Address Space
// ============================================================================

/// One process's virtual memory: page records, hardware table, mappings.
pub struct AddressSpace {
    vm: Arc<Vm>,
    pub pml4: Arc<Pml4>,
    pages: Mutex<BTreeMap<u64, Arc<Mutex<Page>>>>,
    mmaps: Mutex<Vec<MmapRecord>>,
}

impl AddressSpace {
    pub fn new(vm: Arc<Vm>) -> Arc<AddressSpace> {
        Arc::new(AddressSpace {
            vm,
            pml4: Arc::new(Pml4::new()),
            pages: Mutex::new(BTreeMap::new()),
            mmaps: Mutex::new(Vec::new()),
        })
    }

    /// Page records registered, resident or not.
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// Live mmap records.
    pub fn mmap_count(&self) -> usize {
        self.mmaps.lock().len()
    }

    // === Registration ===

    /// Register a lazy page. Nothing is allocated until the first claim,
    /// which runs `init` against the fresh frame.
    pub fn alloc_with_initializer(
        &self,
        target: BackingKind,
        va: VirtAddr,
        writable: bool,
        init: PageInit,
    ) -> Result<()> {
        let backing = Backing::Uninit {
            target,
            init: Some(init),
        };
        self.register(va, writable, backing)
    }

    /// Register and immediately claim an anonymous page; used for stack
    /// growth, where the faulting access needs the frame now.
    pub fn alloc_anon(&self, va: VirtAddr, writable: bool) -> Result<()> {
        self.register(va, writable, Backing::Anon(AnonBacking::new()))?;
        match self.claim(va) {
            Ok(()) => Ok(()),
            Err(e) => {
                // Keep registration atomic with population.
                self.pages.lock().remove(&va.0);
                Err(e)
            }
        }
    }

    fn register(&self, va: VirtAddr, writable: bool, backing: Backing) -> Result<()> {
        if !va.is_page_aligned() {
            return Err(KernError::InvalidArgument("vaddr not page-aligned"));
        }
        if !va.is_user() {
            return Err(KernError::InvalidArgument("vaddr not in user space"));
        }
        let mut pages = self.pages.lock();
        if pages.contains_key(&va.0) {
            return Err(KernError::AlreadyMapped);
        }
        pages.insert(
            va.0,
            Arc::new(Mutex::new(Page::new(va, writable, backing, self.pml4.clone()))),
        );
        Ok(())
    }

    /// Look up the record covering `va` (rounded down).
    pub fn find(&self, va: VirtAddr) -> Option<Arc<Mutex<Page>>> {
        self.pages.lock().get(&va.page_down().0).cloned()
    }

    // === Population ===

    /// Materialize a page: allocate a frame (evicting if the pool is
    /// dry), run the initializer on first claim, load from the backing
    /// store, and install the hardware mapping with the recorded
    /// writability.
    pub fn claim(&self, va: VirtAddr) -> Result<()> {
        let va = va.page_down();
        let page = self.find(va).ok_or(KernError::NotMapped)?;
        let mut pg = page.lock();
        if pg.is_resident() {
            return Ok(());
        }

        // Holding the record lock pins us against the eviction clock.
        let mut kpage = self.vm.frame_page()?;

        if matches!(pg.backing, Backing::Uninit { .. }) {
            let (target, init) = match &mut pg.backing {
                Backing::Uninit { target, init } => (*target, init.take()),
                _ => unreachable!(),
            };
            let ok = match init {
                Some(f) => f(&mut pg, kpage.bytes_mut()),
                None => true,
            };
            if !ok {
                return Err(KernError::IoFailure);
            }
            if matches!(pg.backing, Backing::Uninit { .. }) {
                pg.backing = match target {
                    BackingKind::Anon => Backing::Anon(AnonBacking::new()),
                    BackingKind::File => {
                        return Err(KernError::InvalidArgument(
                            "file page needs an initializer",
                        ))
                    }
                };
            }
        }

        pg.swap_in(&self.vm, kpage.bytes_mut())?;

        let frame = self.vm.frames.install(page.clone(), kpage);
        pg.frame = Some(frame);
        if let Err(e) = self.pml4.map(va, frame, pg.writable) {
            self.vm.frames.take(frame);
            pg.frame = None;
            return Err(e);
        }
        Ok(())
    }

    /// Drop a page: write back or discard per its backing, free its
    /// frame, remove the hardware mapping and the record.
    pub fn remove(&self, va: VirtAddr) -> Result<()> {
        let va = va.page_down();
        let page = self
            .pages
            .lock()
            .remove(&va.0)
            .ok_or(KernError::NotMapped)?;
        let mut pg = page.lock();
        if let Some(frame) = pg.frame.take() {
            let slot = self
                .vm
                .frames
                .take(frame)
                .expect("resident page without a frame slot");
            // Destroy consults the dirty bit, so it runs before unmap.
            pg.destroy(&self.vm, Some(slot.kpage.bytes()));
            self.pml4.unmap(va);
        } else {
            pg.destroy(&self.vm, None);
        }
        Ok(())
    }

    // === Fault routing ===

    /// Resolve a page fault at `fa`. Failure means the access was bad
    /// and the faulting process should die.
    pub fn handle_fault(&self, fa: VirtAddr, code: FaultCode, user_rsp: u64) -> Result<()> {
        if !fa.is_user() {
            return Err(KernError::NotMapped);
        }
        if code.contains(FaultCode::PRESENT) {
            // The page is there; the access violated its rights.
            return Err(KernError::InvalidArgument("protection violation"));
        }

        let va = fa.page_down();
        if let Some(page) = self.find(va) {
            if code.contains(FaultCode::WRITE) && !page.lock().writable {
                return Err(KernError::InvalidArgument("write to read-only page"));
            }
            return self.claim(va);
        }

        if in_stack_window(fa, user_rsp) {
            return self.alloc_anon(va, true);
        }

        Err(KernError::NotMapped)
    }

    // === Memory-mapped files ===

    /// Map `length` bytes of `file` starting at `offset` to `addr`. One
    /// file page is registered per page of the range; the k-th page
    /// mirrors `min(PAGE_SIZE, length - k * PAGE_SIZE)` bytes through its
    /// own reopened handle. Overlap with any existing page is rejected
    /// before anything is installed.
    pub fn mmap(
        &self,
        addr: VirtAddr,
        length: u64,
        writable: bool,
        file: &dyn Vnode,
        offset: u64,
    ) -> Result<VirtAddr> {
        if !addr.is_page_aligned() || addr.0 == 0 {
            return Err(KernError::InvalidArgument("mmap addr"));
        }
        if length == 0 {
            return Err(KernError::InvalidArgument("mmap length"));
        }
        let end = VirtAddr(addr.0 + length - 1);
        if !end.is_user() {
            return Err(KernError::InvalidArgument("mmap range"));
        }
        let last = end.page_down();

        // No partial installation: reject overlap up front.
        {
            let pages = self.pages.lock();
            let mut va = addr;
            loop {
                if pages.contains_key(&va.0) {
                    return Err(KernError::AlreadyMapped);
                }
                if va == last {
                    break;
                }
                va = va.add(PAGE_SIZE as u64);
            }
        }

        let mut va = addr;
        let mut remaining = length;
        let mut ofs = offset;
        loop {
            let valid = remaining.min(PAGE_SIZE as u64) as usize;
            let vnode = file.reopen();
            let init: PageInit = Box::new(move |page: &mut Page, _buf: &mut [u8]| {
                page.backing = Backing::File(FileBacking::new(vnode, ofs, valid));
                true
            });
            self.alloc_with_initializer(BackingKind::File, va, writable, init)?;
            if va == last {
                break;
            }
            va = va.add(PAGE_SIZE as u64);
            remaining -= PAGE_SIZE as u64;
            ofs += PAGE_SIZE as u64;
        }

        self.mmaps.lock().push(MmapRecord { start: addr, last });
        log::debug!("mmap {} bytes at {}", length, addr);
        Ok(addr)
    }

    /// Tear down the mapping that starts at `addr`: every page of it is
    /// removed (dirty file pages written back) and the record dropped. A
    /// second call for the same start address fails with `NotMapped`.
    pub fn munmap(&self, addr: VirtAddr) -> Result<()> {
        let rec = {
            let mut mmaps = self.mmaps.lock();
            let i = mmaps
                .iter()
                .position(|r| r.start == addr)
                .ok_or(KernError::NotMapped)?;
            mmaps.remove(i)
        };

        let mut va = rec.start;
        loop {
            if let Err(e) = self.remove(va) {
                log::warn!("munmap: page {} missing: {}", va, e);
            }
            if va == rec.last {
                break;
            }
            va = va.add(PAGE_SIZE as u64);
        }
        Ok(())
    }

    // === User copy helpers ===

    /// Store `bytes` at `va` as a user write would: faults pages in,
    /// honors writability, sets the accessed and dirty bits.
    pub fn copy_out(&self, va: VirtAddr, bytes: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < bytes.len() {
            let cur = va.add(done as u64);
            let page_va = cur.page_down();
            let n = (PAGE_SIZE - cur.page_offset()).min(bytes.len() - done);

            let page = self.find(page_va).ok_or(KernError::NotMapped)?;
            if !page.lock().writable {
                return Err(KernError::InvalidArgument("write to read-only page"));
            }
            self.claim(page_va)?;

            let (frame, _) = self.pml4.lookup(page_va).ok_or(KernError::NotMapped)?;
            self.pml4.touch(page_va, true);
            self.vm
                .frames
                .with_bytes_mut(frame, |buf| {
                    let off = cur.page_offset();
                    buf[off..off + n].copy_from_slice(&bytes[done..done + n]);
                })
                .ok_or(KernError::NotMapped)?;
            done += n;
        }
        Ok(())
    }

    /// Load from `va` as a user read would: faults pages in and sets the
    /// accessed bit.
    pub fn copy_in(&self, va: VirtAddr, out: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < out.len() {
            let cur = va.add(done as u64);
            let page_va = cur.page_down();
            let n = (PAGE_SIZE - cur.page_offset()).min(out.len() - done);

            self.find(page_va).ok_or(KernError::NotMapped)?;
            self.claim(page_va)?;

            let (frame, _) = self.pml4.lookup(page_va).ok_or(KernError::NotMapped)?;
            self.pml4.touch(page_va, false);
            self.vm
                .frames
                .with_bytes(frame, |buf| {
                    let off = cur.page_offset();
                    out[done..done + n].copy_from_slice(&buf[off..off + n]);
                })
                .ok_or(KernError::NotMapped)?;
            done += n;
        }
        Ok(())
    }
}

/// Does a fault at `fa` with stack pointer `rsp` qualify as growth?
fn in_stack_window(fa: VirtAddr, rsp: u64) -> bool {
    let a = fa.0;
    a < USER_STACK_TOP && a >= USER_STACK_TOP - STACK_LIMIT && a + STACK_GROWTH_WINDOW >= rsp
}

impl Drop for AddressSpace {
    /// Process exit: every mapping is torn down as if `munmap` were
    /// called, then the remaining pages are removed.
    fn drop(&mut self) {
        let starts: Vec<VirtAddr> = self.mmaps.lock().iter().map(|r| r.start).collect();
        for start in starts {
            let _ = self.munmap(start);
        }
        let vas: Vec<u64> = self.pages.lock().keys().copied().collect();
        for va in vas {
            let _ = self.remove(VirtAddr(va));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::RamDisk;
    use crate::fs::MemFile;
    use crate::palloc::PagePool;
    use crate::vm::page::PageKind;
    use crate::vm::swap::SECTORS_PER_PAGE;

    fn vm(user_pages: usize, swap_pages: usize) -> Arc<Vm> {
        Vm::new(
            PagePool::new("user", user_pages),
            Box::new(RamDisk::new((swap_pages * SECTORS_PER_PAGE) as u64)),
        )
    }

    fn anon_init() -> PageInit {
        Box::new(|_page, _buf| true)
    }

    #[test]
    fn test_register_validates_address() {
        let space = AddressSpace::new(vm(4, 4));
        assert_eq!(
            space.alloc_with_initializer(BackingKind::Anon, VirtAddr(0x4001), true, anon_init()),
            Err(KernError::InvalidArgument("vaddr not page-aligned"))
        );
        assert_eq!(
            space.alloc_with_initializer(
                BackingKind::Anon,
                VirtAddr(crate::types::KERN_BASE),
                true,
                anon_init()
            ),
            Err(KernError::InvalidArgument("vaddr not in user space"))
        );

        space
            .alloc_with_initializer(BackingKind::Anon, VirtAddr(0x4000), true, anon_init())
            .unwrap();
        assert_eq!(
            space.alloc_with_initializer(BackingKind::Anon, VirtAddr(0x4000), true, anon_init()),
            Err(KernError::AlreadyMapped)
        );
    }

    #[test]
    fn test_claim_upgrades_and_maps() {
        let space = AddressSpace::new(vm(4, 4));
        let va = VirtAddr(0x4000);
        space
            .alloc_with_initializer(BackingKind::Anon, va, true, anon_init())
            .unwrap();
        assert_eq!(space.find(va).unwrap().lock().kind(), PageKind::Uninit);

        space.claim(va).unwrap();
        let page = space.find(va).unwrap();
        assert_eq!(page.lock().kind(), PageKind::Anon);
        assert!(page.lock().is_resident());
        assert!(space.pml4.is_mapped(va));

        // Claiming a resident page is a no-op.
        space.claim(va).unwrap();
    }

    #[test]
    fn test_find_rounds_down() {
        let space = AddressSpace::new(vm(4, 4));
        space
            .alloc_with_initializer(BackingKind::Anon, VirtAddr(0x4000), true, anon_init())
            .unwrap();
        assert!(space.find(VirtAddr(0x4abc)).is_some());
        assert!(space.find(VirtAddr(0x5000)).is_none());
    }

    #[test]
    fn test_remove_frees_frame_and_record() {
        let v = vm(4, 4);
        let space = AddressSpace::new(v.clone());
        let va = VirtAddr(0x4000);
        space.alloc_anon(va, true).unwrap();
        assert_eq!(v.frames.in_use(), 1);

        space.remove(va).unwrap();
        assert_eq!(v.frames.in_use(), 0);
        assert!(!space.pml4.is_mapped(va));
        assert_eq!(space.remove(va), Err(KernError::NotMapped));
        assert_eq!(v.user_pool().free_pages(), 4);
    }

    #[test]
    fn test_fault_routes_registered_page() {
        let space = AddressSpace::new(vm(4, 4));
        let va = VirtAddr(0x4000);
        space
            .alloc_with_initializer(BackingKind::Anon, va, false, anon_init())
            .unwrap();

        // Write fault on a read-only page fails without claiming.
        assert!(space
            .handle_fault(VirtAddr(0x4010), FaultCode::WRITE | FaultCode::USER, 0)
            .is_err());
        assert!(!space.find(va).unwrap().lock().is_resident());

        space
            .handle_fault(VirtAddr(0x4010), FaultCode::USER, 0)
            .unwrap();
        assert!(space.find(va).unwrap().lock().is_resident());
    }

    #[test]
    fn test_fault_rejects_kernel_and_unmapped() {
        let space = AddressSpace::new(vm(4, 4));
        assert_eq!(
            space.handle_fault(VirtAddr(crate::types::KERN_BASE + 8), FaultCode::USER, 0),
            Err(KernError::NotMapped)
        );
        assert_eq!(
            space.handle_fault(VirtAddr(0x9000_0000), FaultCode::USER, 0),
            Err(KernError::NotMapped)
        );
    }

    #[test]
    fn test_stack_growth_window() {
        let space = AddressSpace::new(vm(8, 4));
        let rsp = USER_STACK_TOP - 0x20;

        // One push below the stack pointer grows the stack.
        space
            .handle_fault(VirtAddr(rsp - 8), FaultCode::WRITE | FaultCode::USER, rsp)
            .unwrap();
        assert!(space.find(VirtAddr(rsp - 8)).is_some());

        // Far below the stack pointer does not.
        assert!(space
            .handle_fault(
                VirtAddr(rsp - 3 * PAGE_SIZE as u64),
                FaultCode::WRITE | FaultCode::USER,
                rsp
            )
            .is_err());

        // Beyond the stack limit does not.
        assert!(space
            .handle_fault(
                VirtAddr(USER_STACK_TOP - STACK_LIMIT - PAGE_SIZE as u64),
                FaultCode::WRITE | FaultCode::USER,
                0
            )
            .is_err());
    }

    #[test]
    fn test_copy_round_trip_sets_bits() {
        let space = AddressSpace::new(vm(4, 4));
        let va = VirtAddr(0x4000);
        space.alloc_anon(va, true).unwrap();

        space.pml4.set_accessed(va, false);
        space.copy_out(va.add(100), b"payload").unwrap();
        assert!(space.pml4.is_accessed(va));
        assert!(space.pml4.is_dirty(va));

        let mut back = [0u8; 7];
        space.copy_in(va.add(100), &mut back).unwrap();
        assert_eq!(&back, b"payload");
    }

    #[test]
    fn test_copy_spans_pages() {
        let space = AddressSpace::new(vm(4, 4));
        space.alloc_anon(VirtAddr(0x4000), true).unwrap();
        space.alloc_anon(VirtAddr(0x5000), true).unwrap();

        let data: Vec<u8> = (0..64u8).collect();
        space.copy_out(VirtAddr(0x5000 - 32), &data).unwrap();
        let mut back = [0u8; 64];
        space.copy_in(VirtAddr(0x5000 - 32), &mut back).unwrap();
        assert_eq!(&back[..], &data[..]);
    }

    #[test]
    fn test_mmap_rejects_overlap_atomically() {
        let space = AddressSpace::new(vm(8, 4));
        let f = MemFile::with_contents(&[1u8; 3 * PAGE_SIZE]);
        space.alloc_anon(VirtAddr(0x6000), true).unwrap();

        // Third page collides; nothing of the mapping may be installed.
        let before = space.page_count();
        assert_eq!(
            space.mmap(VirtAddr(0x4000), 3 * PAGE_SIZE as u64, true, &f, 0),
            Err(KernError::AlreadyMapped)
        );
        assert_eq!(space.page_count(), before);
        assert_eq!(space.mmap_count(), 0);
    }

    #[test]
    fn test_munmap_twice_fails() {
        let space = AddressSpace::new(vm(8, 4));
        let f = MemFile::with_contents(&[9u8; PAGE_SIZE]);
        let addr = space
            .mmap(VirtAddr(0x4000), PAGE_SIZE as u64, true, &f, 0)
            .unwrap();
        space.munmap(addr).unwrap();
        assert_eq!(space.munmap(addr), Err(KernError::NotMapped));
    }
}
