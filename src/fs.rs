//! File interface
//!
//! The page subsystem only needs a narrow positioned-I/O surface from the
//! filesystem: reopen a private handle, seek, read, write. Closing is
//! dropping the handle. `MemFile` is the hosted double; handles from
//! `reopen` share one backing buffer, so write-back through one handle is
//! visible to every other, like reopened inode handles.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::Result;

/// An open file handle with an independent cursor.
pub trait Vnode: Send {
    /// Open a new independent handle onto the same underlying file.
    fn reopen(&self) -> Box<dyn Vnode>;

    /// Current file length in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the cursor to an absolute position.
    fn seek(&mut self, pos: u64);

    /// Cursor position.
    fn tell(&self) -> u64;

    /// Read at the cursor; returns bytes read (short at end of file).
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write at the cursor, extending the file if needed; returns bytes
    /// written.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

// ============================================================================
// Memory-backed double
// ============================================================================

/// In-memory file. All reopened handles share the same contents.
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl MemFile {
    pub fn new() -> Self {
        Self {
            data: Arc::new(Mutex::new(Vec::new())),
            pos: 0,
        }
    }

    pub fn with_contents(bytes: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(bytes.to_vec())),
            pos: 0,
        }
    }

    /// Read the underlying contents directly, bypassing any handle.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl Default for MemFile {
    fn default() -> Self {
        Self::new()
    }
}

impl Vnode for MemFile {
    fn reopen(&self) -> Box<dyn Vnode> {
        Box::new(MemFile {
            data: Arc::clone(&self.data),
            pos: 0,
        })
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let start = self.pos.min(data.len() as u64) as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        drop(data);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let start = self.pos as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        drop(data);
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }
}
