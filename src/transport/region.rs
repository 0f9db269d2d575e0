//! Validated memory-mapped register region.
//!
//! All accesses are 32-bit, word-aligned and bounds-checked against the
//! region length. Reads and writes go through atomic loads and stores on
//! the mapped words, so the compiler can neither elide nor reorder them
//! across the explicit fences used for completion writes.

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use crate::error::{DrvError, DrvResult};

const WORD: usize = std::mem::size_of::<u32>();

enum Backing {
    /// Heap words owned by the region (simulated devices, tests).
    Heap(#[allow(dead_code)] Box<[AtomicU32]>),
    /// Mapping owned elsewhere; kept alive until the region drops.
    External(#[allow(dead_code)] Box<dyn Send + Sync>),
}

/// A mapped register window with scoped lifetime.
pub struct RegisterRegion {
    base: NonNull<AtomicU32>,
    len: usize,
    _backing: Backing,
}

// SAFETY: every access goes through `AtomicU32` operations on in-bounds,
// aligned words, and the backing outlives `base`.
unsafe impl Send for RegisterRegion {}
unsafe impl Sync for RegisterRegion {}

impl RegisterRegion {
    /// Zero-filled heap region of `len` bytes (rounded up to whole words).
    pub fn zeroed(len: usize) -> Self {
        let words = len.div_ceil(WORD);
        let mut backing: Box<[AtomicU32]> = (0..words).map(|_| AtomicU32::new(0)).collect();
        let base = NonNull::new(backing.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            base,
            len: words * WORD,
            _backing: Backing::Heap(backing),
        }
    }

    /// Wrap an existing mapping.
    ///
    /// # Safety
    /// `base` must be valid for reads and writes of `len` bytes, 4-byte
    /// aligned, and stay mapped for as long as `owner` is alive.
    pub unsafe fn from_raw_parts(
        base: *mut u8,
        len: usize,
        owner: Box<dyn Send + Sync>,
    ) -> DrvResult<Self> {
        let base = NonNull::new(base.cast::<AtomicU32>()).ok_or(DrvError::ParaError)?;
        if base.as_ptr() as usize % WORD != 0 || len % WORD != 0 {
            return Err(DrvError::ParaError);
        }
        Ok(Self {
            base,
            len,
            _backing: Backing::External(owner),
        })
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn word(&self, offset: usize) -> DrvResult<&AtomicU32> {
        if offset % WORD != 0 || offset.checked_add(WORD).map_or(true, |end| end > self.len) {
            return Err(DrvError::ParaError);
        }
        // SAFETY: bounds and alignment checked above; backing is alive.
        Ok(unsafe { &*self.base.as_ptr().add(offset / WORD) })
    }

    /// Read a status or data word.
    pub fn read_u32(&self, offset: usize) -> DrvResult<u32> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }

    /// Plain register write.
    pub fn write_u32(&self, offset: usize, value: u32) -> DrvResult<()> {
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Register write fenced on both sides; used for hardware handshakes
    /// that must be observed in program order.
    pub fn write_u32_fenced(&self, offset: usize, value: u32) -> DrvResult<()> {
        let word = self.word(offset)?;
        fence(Ordering::SeqCst);
        word.store(value, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Atomically replace `current` with `new`. Returns the value found
    /// when it did not match.
    pub fn compare_exchange_u32(
        &self,
        offset: usize,
        current: u32,
        new: u32,
    ) -> DrvResult<std::result::Result<u32, u32>> {
        Ok(self
            .word(offset)?
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire))
    }

    /// Copy `out.len()` bytes starting at a word-aligned offset.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) -> DrvResult<()> {
        for (i, chunk) in out.chunks_mut(WORD).enumerate() {
            let word = self.read_u32(offset + i * WORD)?.to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    /// Write bytes starting at a word-aligned offset; a trailing partial
    /// word is zero-padded.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> DrvResult<()> {
        for (i, chunk) in data.chunks(WORD).enumerate() {
            let mut word = [0u8; WORD];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write_u32(offset + i * WORD, u32::from_le_bytes(word))?;
        }
        Ok(())
    }
}

impl fmt::Debug for RegisterRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_and_alignment() {
        let region = RegisterRegion::zeroed(64);
        assert_eq!(region.len(), 64);
        assert!(region.write_u32(60, 7).is_ok());
        assert_eq!(region.read_u32(60).unwrap(), 7);
        assert_eq!(region.read_u32(64), Err(DrvError::ParaError));
        assert_eq!(region.write_u32(2, 1), Err(DrvError::ParaError));
        assert_eq!(region.read_u32(usize::MAX - 1), Err(DrvError::ParaError));
    }

    #[test]
    fn test_bytes_with_partial_word() {
        let region = RegisterRegion::zeroed(32);
        region.write_bytes(8, &[1, 2, 3, 4, 5, 6]).unwrap();
        let mut out = [0u8; 6];
        region.read_bytes(8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        assert_eq!(region.read_u32(12).unwrap(), u32::from_le_bytes([5, 6, 0, 0]));
    }

    #[test]
    fn test_fenced_write_visible_across_threads() {
        let region = std::sync::Arc::new(RegisterRegion::zeroed(16));
        let writer = std::sync::Arc::clone(&region);
        std::thread::spawn(move || writer.write_u32_fenced(4, 0xdead_beef).unwrap())
            .join()
            .unwrap();
        assert_eq!(region.read_u32(4).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_compare_exchange_claims_once() {
        let region = RegisterRegion::zeroed(16);
        region.write_u32(8, 1).unwrap();
        assert_eq!(region.compare_exchange_u32(8, 1, 2).unwrap(), Ok(1));
        assert_eq!(region.compare_exchange_u32(8, 1, 2).unwrap(), Err(2));
        assert_eq!(region.compare_exchange_u32(10, 0, 1), Err(DrvError::ParaError));
    }

    #[test]
    fn test_external_rejects_null() {
        let res = unsafe { RegisterRegion::from_raw_parts(std::ptr::null_mut(), 16, Box::new(())) };
        assert!(res.is_err());
    }
}
