//! Bounds-checked access to shared-memory blocks.
//!
//! A [`MemoryWindow`] is the only place raw pointers into a shared-memory
//! block are dereferenced. File-backed windows are shared with other
//! processes mapping the same file; owned windows live on the heap and are
//! used by drivers whose peer memory is reached over a network.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{XferError, XferResult};

/// Alignment of owned windows and of every flag word.
pub const WINDOW_ALIGNMENT: usize = 64;
pub const FLAG_SIZE: u64 = 8;

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::MmapMut),
    Owned { layout: Layout },
}

#[derive(Debug)]
pub struct MemoryWindow {
    base: NonNull<u8>,
    len: usize,
    backing: Backing,
}

// SAFETY: all access goes through copies or atomics on the raw base pointer;
// exclusive use of a byte range is coordinated by the flag protocol above.
unsafe impl Send for MemoryWindow {}
unsafe impl Sync for MemoryWindow {}

impl MemoryWindow {
    /// Allocates a zeroed, process-private window.
    pub fn owned(len: usize) -> XferResult<Self> {
        let layout = Layout::from_size_align(len.max(1), WINDOW_ALIGNMENT).map_err(|_| {
            XferError::OutOfBounds {
                offset: 0,
                len: len as u64,
                size: isize::MAX as u64,
            }
        })?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or_else(|| {
            XferError::map_failed("heap", format!("allocation of {len} bytes failed"))
        })?;
        Ok(Self {
            base,
            len,
            backing: Backing::Owned { layout },
        })
    }

    /// Maps `len` bytes of `file` shared with every other mapping of it.
    pub fn map_file(file: &File, len: usize) -> XferResult<Self> {
        // SAFETY: the backing file is sized by the caller and only accessed
        // through this window's checked methods.
        let mut map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(file)? };
        let base = NonNull::new(map.as_mut_ptr())
            .ok_or_else(|| XferError::map_failed("file", "mapping returned null"))?;
        Ok(Self {
            base,
            len,
            backing: Backing::Mapped(map),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::Mapped(_))
    }

    fn check(&self, offset: u64, len: u64) -> XferResult<usize> {
        let end = offset.checked_add(len);
        match end {
            Some(end) if end <= self.len as u64 => Ok(offset as usize),
            _ => Err(XferError::OutOfBounds {
                offset,
                len,
                size: self.len as u64,
            }),
        }
    }

    fn check_flag(&self, offset: u64) -> XferResult<usize> {
        if offset % FLAG_SIZE != 0 {
            return Err(XferError::Misaligned(offset));
        }
        self.check(offset, FLAG_SIZE)
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) -> XferResult<()> {
        let at = self.check(offset, bytes.len() as u64)?;
        // SAFETY: range checked above; source is a distinct Rust slice.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.as_ptr().add(at), bytes.len());
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> XferResult<()> {
        let at = self.check(offset, out.len() as u64)?;
        // SAFETY: range checked above; destination is a distinct Rust slice.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(at), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }

    pub fn read_vec(&self, offset: u64, len: u64) -> XferResult<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        self.read(offset, &mut out)?;
        Ok(out)
    }

    /// Copies `len` bytes into `dst`, which may be this same window.
    pub fn copy_to(&self, src_offset: u64, dst: &MemoryWindow, dst_offset: u64, len: u64) -> XferResult<()> {
        let from = self.check(src_offset, len)?;
        let to = dst.check(dst_offset, len)?;
        // SAFETY: both ranges checked; `copy` tolerates overlap.
        unsafe {
            ptr::copy(
                self.base.as_ptr().add(from),
                dst.base.as_ptr().add(to),
                len as usize,
            );
        }
        Ok(())
    }

    pub fn fill(&self, offset: u64, len: u64, value: u8) -> XferResult<()> {
        let at = self.check(offset, len)?;
        // SAFETY: range checked above.
        unsafe { ptr::write_bytes(self.base.as_ptr().add(at), value, len as usize) };
        Ok(())
    }

    fn flag(&self, at: usize) -> &AtomicU64 {
        // SAFETY: caller validated bounds and 8-byte alignment of the offset;
        // the base is at least 64-byte aligned (page or WINDOW_ALIGNMENT).
        unsafe { &*(self.base.as_ptr().add(at) as *const AtomicU64) }
    }

    /// Acquire-loads a flag word; payload written before the matching
    /// [`MemoryWindow::store_flag`] is visible afterwards.
    pub fn load_flag(&self, offset: u64) -> XferResult<u64> {
        let at = self.check_flag(offset)?;
        Ok(self.flag(at).load(Ordering::Acquire))
    }

    /// Release-stores a flag word.
    pub fn store_flag(&self, offset: u64, value: u64) -> XferResult<()> {
        let at = self.check_flag(offset)?;
        self.flag(at).store(value, Ordering::Release);
        Ok(())
    }

    /// Borrows a byte range immutably.
    ///
    /// # Safety
    ///
    /// No writer may touch the range while the slice is alive.
    pub unsafe fn slice(&self, offset: u64, len: u64) -> XferResult<&[u8]> {
        let at = self.check(offset, len)?;
        Ok(std::slice::from_raw_parts(
            self.base.as_ptr().add(at),
            len as usize,
        ))
    }

    /// Borrows a byte range mutably.
    ///
    /// # Safety
    ///
    /// The caller must own the range exclusively while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: u64, len: u64) -> XferResult<&mut [u8]> {
        let at = self.check(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(
            self.base.as_ptr().add(at),
            len as usize,
        ))
    }
}

impl Drop for MemoryWindow {
    fn drop(&mut self) {
        if let Backing::Owned { layout } = &self.backing {
            // SAFETY: allocated in `owned` with this exact layout.
            unsafe { dealloc(self.base.as_ptr(), *layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owned_window_starts_zeroed_and_aligned() {
        let window = MemoryWindow::owned(256).expect("window");
        assert_eq!(window.len(), 256);
        assert!(!window.is_file_backed());
        assert_eq!(window.read_vec(0, 256).expect("read"), vec![0u8; 256]);
        assert_eq!(window.base.as_ptr() as usize % WINDOW_ALIGNMENT, 0);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let window = MemoryWindow::owned(64).expect("window");
        assert!(matches!(
            window.write(60, &[0u8; 8]),
            Err(XferError::OutOfBounds { .. })
        ));
        assert!(matches!(
            window.read(u64::MAX, &mut [0u8; 2]),
            Err(XferError::OutOfBounds { .. })
        ));
        assert!(matches!(
            window.load_flag(4),
            Err(XferError::Misaligned(4))
        ));
    }

    #[test]
    fn copy_between_windows() {
        let src = MemoryWindow::owned(64).expect("src");
        let dst = MemoryWindow::owned(64).expect("dst");
        src.write(8, b"payload!").expect("write");
        src.copy_to(8, &dst, 32, 8).expect("copy");
        assert_eq!(dst.read_vec(32, 8).expect("read"), b"payload!");
    }

    #[test]
    fn flags_round_trip() {
        let window = MemoryWindow::owned(64).expect("window");
        window.store_flag(16, 0xDEAD_BEEF).expect("store");
        assert_eq!(window.load_flag(16).expect("load"), 0xDEAD_BEEF);
    }

    #[test]
    fn file_backed_windows_share_bytes() {
        let dir = std::env::temp_dir().join(format!("xfer-window-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("dir");
        let path = dir.join("shared");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .expect("file");
        file.set_len(4096).expect("size");

        let a = MemoryWindow::map_file(&file, 4096).expect("map a");
        let b = MemoryWindow::map_file(&file, 4096).expect("map b");
        a.write(100, b"shared").expect("write");
        a.store_flag(200, 1).expect("flag");
        assert_eq!(b.load_flag(200).expect("flag"), 1);
        assert_eq!(b.read_vec(100, 6).expect("read"), b"shared");
        assert!(a.is_file_backed());

        drop((a, b));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
