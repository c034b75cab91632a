//! Shared file mapping with bounds-checked volatile reads

use std::fs::File;
use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};

use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::layout::offsets;

/// One `MAP_SHARED` mapping of a lookup map file.
///
/// Readers map read-only; the writer maps read-write so it can flag the
/// image stale once a replacement has been renamed into place.
pub struct MapRegion {
    base: NonNull<u8>,
    len: usize,
    writable: bool,
}

// Safety: the region is plain bytes with no interior pointers. Every
// access is a bounds-checked volatile read, and the only write after
// publication is the single-byte remap flag, done atomically.
unsafe impl Send for MapRegion {}
unsafe impl Sync for MapRegion {}

impl MapRegion {
    /// Map `len` bytes of `file` from offset 0.
    pub fn map(file: &File, len: usize, writable: bool) -> io::Result<Self> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero length mapping"))?;
        let prot = if writable {
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE
        } else {
            ProtFlags::PROT_READ
        };

        // Safety: fresh mapping chosen by the kernel, not aliasing any Rust object
        let ptr = unsafe { mmap(None, length, prot, MapFlags::MAP_SHARED, file, 0) }
            .map_err(io::Error::from)?;

        Ok(Self {
            base: ptr.cast(),
            len,
            writable,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn in_bounds(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }

    #[inline]
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        if !self.in_bounds(offset, 4) {
            return None;
        }
        // Safety: bounds checked above; unaligned read tolerates any offset
        Some(unsafe { self.base.as_ptr().add(offset).cast::<u32>().read_unaligned() })
    }

    #[inline]
    pub fn read_i32(&self, offset: usize) -> Option<i32> {
        self.read_u32(offset).map(|v| v as i32)
    }

    /// Borrow `len` bytes at `offset`
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        if !self.in_bounds(offset, len) {
            return None;
        }
        // Safety: bounds checked; the mapping lives as long as `self`
        Some(unsafe { std::slice::from_raw_parts(self.base.as_ptr().add(offset), len) })
    }

    fn remap_cell(&self) -> &AtomicU8 {
        // Safety: the header is at least HEADER_SIZE bytes (checked by the
        // reader before a region is kept) and AtomicU8 has alignment 1
        unsafe { &*self.base.as_ptr().add(offsets::REMAP_FLAG).cast::<AtomicU8>() }
    }

    /// Current remap flag, observed across processes
    pub fn remap_flag(&self) -> u8 {
        if self.len <= offsets::REMAP_FLAG {
            return 0;
        }
        self.remap_cell().load(Ordering::Acquire)
    }

    /// Publish a new remap flag. Only a writable region may do this.
    pub fn set_remap_flag(&self, flag: u8) -> io::Result<()> {
        if !self.writable || self.len <= offsets::REMAP_FLAG {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "remap flag on a read-only mapping",
            ));
        }
        self.remap_cell().store(flag, Ordering::Release);
        Ok(())
    }
}

impl Drop for MapRegion {
    fn drop(&mut self) {
        // Safety: base/len came from a successful mmap and are unmapped once
        unsafe {
            let _ = munmap(self.base.cast(), self.len);
        }
    }
}

impl std::fmt::Debug for MapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("writable", &self.writable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(tag: &str, bytes: &[u8]) -> (std::path::PathBuf, File) {
        let path = std::env::temp_dir().join(format!("plexrpc-mapping-{}-{}", tag, std::process::id()));
        let mut f = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(bytes).unwrap();
        (path, f)
    }

    #[test]
    fn test_bounds_checked_reads() {
        let mut image = vec![0u8; 32];
        image[8..12].copy_from_slice(&77u32.to_ne_bytes());
        let (path, f) = scratch_file("bounds", &image);
        let region = MapRegion::map(&f, image.len(), false).unwrap();

        assert_eq!(region.read_u32(8), Some(77));
        assert_eq!(region.read_u32(29), None);
        assert_eq!(region.read_u32(usize::MAX - 1), None);
        assert_eq!(region.bytes(30, 2).map(|b| b.len()), Some(2));
        assert!(region.bytes(30, 3).is_none());
        assert!(region.set_remap_flag(b'Y').is_err());

        drop(region);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_remap_flag_visible_to_second_mapping() {
        let mut image = vec![0u8; 28];
        image[4] = b'n';
        let (path, f) = scratch_file("flag", &image);
        let writer = MapRegion::map(&f, image.len(), true).unwrap();
        let reader = MapRegion::map(&File::open(&path).unwrap(), image.len(), false).unwrap();

        assert_eq!(reader.remap_flag(), b'n');
        writer.set_remap_flag(b'Y').unwrap();
        assert_eq!(reader.remap_flag(), b'Y');

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_zero_length_rejected() {
        let (path, f) = scratch_file("empty", &[]);
        assert!(MapRegion::map(&f, 0, false).is_err());
        std::fs::remove_file(path).unwrap();
    }
}
