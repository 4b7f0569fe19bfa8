//! Block device interface
//!
//! The swap table sits on top of this. Only fixed-size sector transfers
//! are supported; callers do their own page-to-sector arithmetic.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::{KernError, Result};

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 512;

/// A device exposing fixed-size sector reads and writes.
pub trait BlockDevice: Send + Sync {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    /// Read one sector into `buf` (`buf.len() >= SECTOR_SIZE`).
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write one sector from `buf` (`buf.len() >= SECTOR_SIZE`).
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()>;
}

// ============================================================================
// RAM-backed double
// ============================================================================

/// Memory-backed block device used for swap in the hosted kernel.
pub struct RamDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl RamDisk {
    pub fn new(sector_count: u64) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count as usize]),
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        self.sectors.lock().len() as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let sectors = self.sectors.lock();
        let src = sectors
            .get(sector as usize)
            .ok_or(KernError::IoFailure)?;
        buf[..SECTOR_SIZE].copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<()> {
        let mut sectors = self.sectors.lock();
        let dst = sectors
            .get_mut(sector as usize)
            .ok_or(KernError::IoFailure)?;
        dst.copy_from_slice(&buf[..SECTOR_SIZE]);
        Ok(())
    }
}
