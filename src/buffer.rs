//! Caller-owned destination buffer for reads
//!
//! In shared-buffer mode the script side writes read results straight into
//! this buffer, after the call that handed it over has already returned. The
//! buffer is reference counted so it outlives the call; its length is fixed
//! at creation and cannot change while a read against it is outstanding.

use crate::error::{FileReaderError, Result};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Box<[u8]>>>,
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .finish()
    }
}

impl SharedBuffer {
    /// Zero-filled buffer of `len` bytes
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(vec![0u8; len].into_boxed_slice())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `data` into the buffer starting at `offset`
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<()> {
        let mut bytes = self.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                FileReaderError::InvalidArgument(format!(
                    "write of {} bytes at offset {} exceeds buffer of {} bytes",
                    data.len(),
                    offset,
                    bytes.len()
                ))
            })?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy bytes starting at `offset` into `dst`, returning how many were copied
    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) -> usize {
        let bytes = self.lock();
        if offset >= bytes.len() {
            return 0;
        }
        let n = dst.len().min(bytes.len() - offset);
        dst[..n].copy_from_slice(&bytes[offset..offset + n]);
        n
    }

    /// Snapshot of `len` bytes starting at `offset`
    pub fn to_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let n = self.copy_to(offset, &mut out);
        out.truncate(n);
        out
    }

    /// Whether two handles refer to the same underlying storage
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}
