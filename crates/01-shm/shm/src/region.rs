//! Memory mapping helpers for the shared segments.
//!
//! A world segment and every SHM pool live in a file inside the shared memory
//! directory. Each process maps those files independently, so the same
//! structure may sit at a different base address in every participant. This
//! module keeps the unsafe surface of that arrangement tightly encapsulated:
//! callers address memory by offset and get bounds-checked views back.

use crate::{ShmError, ShmResult};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64};

/// Marker for types that may be viewed in place inside a shared region.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or primitive), valid for every bit
/// pattern including all zeroes, and only mutated through atomics. Shared
/// memory is aliased by other processes, so plain fields would race.
pub unsafe trait ShmLayout: Sync {}

// SAFETY: atomics are valid for any bit pattern and only mutated atomically.
unsafe impl ShmLayout for AtomicU32 {}
// SAFETY: as above.
unsafe impl ShmLayout for AtomicU64 {}
// SAFETY: arrays of layout-safe elements keep the same guarantees.
unsafe impl<T: ShmLayout, const N: usize> ShmLayout for [T; N] {}

/// A mapping of a shared file (or an anonymous block for single-process use).
///
/// The region only ever grows: when the backing file is extended, a fresh
/// mapping is created with [`SharedRegion::open`] while old mappings stay
/// valid for the range they cover.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
    path: Option<PathBuf>,
    // Keeps the mapping alive; `ptr` was derived from it with write provenance.
    _map: MmapMut,
}

// SAFETY: the region is plain shared memory; all typed access goes through
// `ShmLayout` views (atomics) or explicit byte copies.
unsafe impl Send for SharedRegion {}
// SAFETY: see above.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Exclusively creates `path` with `len` zeroed bytes and maps it.
    ///
    /// Fails with [`ShmError::Exists`] when another process created it first.
    pub fn create(path: &Path, len: usize) -> ShmResult<Self> {
        if len == 0 {
            return Err(ShmError::InvalidCapacity {
                requested: 0,
                minimum: 1,
            });
        }

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(ShmError::Exists(path.to_path_buf()));
            }
            Err(err) => return Err(ShmError::map(path, err)),
        };
        set_permissions(&file, path)?;
        file.set_len(len as u64)
            .map_err(|err| ShmError::map(path, err))?;
        Self::map_file(&file, path, len)
    }

    /// Maps an existing file with its current length.
    pub fn open(path: &Path) -> ShmResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| ShmError::map(path, err))?;
        let len = file
            .metadata()
            .map_err(|err| ShmError::map(path, err))?
            .len() as usize;
        if len == 0 {
            return Err(ShmError::map(
                path,
                io::Error::new(io::ErrorKind::InvalidData, "segment file is empty"),
            ));
        }
        Self::map_file(&file, path, len)
    }

    /// Maps an anonymous zeroed block; only visible inside this process.
    pub fn anonymous(len: usize) -> ShmResult<Self> {
        let mut map = MmapOptions::new()
            .len(len.max(1))
            .map_anon()
            .map_err(|err| ShmError::map("<anonymous>", err))?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or(ShmError::Corrupt("anonymous mapping returned null"))?;
        Ok(Self {
            ptr,
            len,
            path: None,
            _map: map,
        })
    }

    fn map_file(file: &File, path: &Path, len: usize) -> ShmResult<Self> {
        let mut map = unsafe {
            // SAFETY: the file is shared with cooperating processes only; all
            // concurrent mutation goes through atomics or lock-guarded copies.
            MmapOptions::new().len(len).map_mut(file)
        }
        .map_err(|err| ShmError::map(path, err))?;
        let ptr = NonNull::new(map.as_mut_ptr())
            .ok_or(ShmError::Corrupt("file mapping returned null"))?;
        Ok(Self {
            ptr,
            len,
            path: Some(path.to_path_buf()),
            _map: map,
        })
    }

    /// Extends the backing file to `new_len` bytes. Existing mappings are
    /// untouched; call [`SharedRegion::open`] to map the larger file.
    pub fn grow_file(path: &Path, new_len: usize) -> ShmResult<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|err| ShmError::map(path, err))?;
        let current = file
            .metadata()
            .map_err(|err| ShmError::map(path, err))?
            .len();
        if current < new_len as u64 {
            file.set_len(new_len as u64)
                .map_err(|err| ShmError::map(path, err))?;
        }
        Ok(())
    }

    /// Removes a backing file. Missing files are not an error.
    pub fn unlink(path: &Path) -> ShmResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ShmError::map(path, err)),
        }
    }

    /// Total number of bytes covered by this mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Base address of this process' mapping. Only meaningful locally.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn check(&self, offset: usize, len: usize) -> ShmResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                mapped: self.len,
            }),
        }
    }

    /// Views a shared structure at `offset`.
    pub fn at<T: ShmLayout>(&self, offset: usize) -> ShmResult<&T> {
        self.check(offset, std::mem::size_of::<T>())?;
        if offset % std::mem::align_of::<T>() != 0 {
            return Err(ShmError::Corrupt("misaligned shared structure"));
        }
        // SAFETY: bounds and alignment were checked; `ShmLayout` types are
        // valid for any bit pattern and only mutated atomically.
        Ok(unsafe { &*(self.ptr.as_ptr().add(offset) as *const T) })
    }

    /// Borrows raw bytes. Contents may change underneath the caller unless the
    /// lock guarding this range is held.
    pub fn slice(&self, offset: usize, len: usize) -> ShmResult<&[u8]> {
        self.check(offset, len)?;
        // SAFETY: range checked above; the mapping outlives `&self`.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    /// Copies bytes out of the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> ShmResult<()> {
        self.check(offset, buf.len())?;
        // SAFETY: range checked; `buf` is private memory and cannot overlap.
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
        };
        Ok(())
    }

    /// Copies bytes into the region.
    pub fn write(&self, offset: usize, data: &[u8]) -> ShmResult<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked; `ptr` carries write provenance from the map.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len())
        };
        Ok(())
    }

    /// Fills `len` bytes at `offset` with `byte`.
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> ShmResult<()> {
        self.check(offset, len)?;
        // SAFETY: range checked above.
        unsafe { ptr::write_bytes(self.ptr.as_ptr().add(offset), byte, len) };
        Ok(())
    }

    /// Moves `len` bytes from `src` to `dst`; the ranges may overlap.
    pub fn copy_within(&self, src: usize, dst: usize, len: usize) -> ShmResult<()> {
        self.check(src, len)?;
        self.check(dst, len)?;
        // SAFETY: both ranges checked; `ptr::copy` handles overlap.
        unsafe {
            ptr::copy(
                self.ptr.as_ptr().add(src),
                self.ptr.as_ptr().add(dst),
                len,
            )
        };
        Ok(())
    }
}

#[cfg(unix)]
fn set_permissions(file: &File, path: &Path) -> ShmResult<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|err| ShmError::map(path, err))
}

#[cfg(not(unix))]
fn set_permissions(_file: &File, _path: &Path) -> ShmResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn two_mappings_observe_the_same_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment");
        let a = SharedRegion::create(&path, 4096).expect("create");
        let b = SharedRegion::open(&path).expect("open");
        assert_eq!(b.len(), 4096);

        a.write(128, b"fusion").expect("write");
        let mut buf = [0u8; 6];
        b.read(128, &mut buf).expect("read");
        assert_eq!(&buf, b"fusion");

        let counter_a = a.at::<AtomicU32>(64).expect("view");
        let counter_b = b.at::<AtomicU32>(64).expect("view");
        counter_a.fetch_add(3, Ordering::AcqRel);
        assert_eq!(counter_b.load(Ordering::Acquire), 3);
    }

    #[test]
    fn exclusive_create_reports_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment");
        let _first = SharedRegion::create(&path, 64).expect("create");
        assert!(matches!(
            SharedRegion::create(&path, 64),
            Err(ShmError::Exists(_))
        ));
    }

    #[test]
    fn grown_file_needs_a_fresh_mapping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("segment");
        let small = SharedRegion::create(&path, 4096).expect("create");
        SharedRegion::grow_file(&path, 8192).expect("grow");
        assert!(small.write(6000, b"x").is_err());

        let large = SharedRegion::open(&path).expect("reopen");
        large.write(6000, b"x").expect("write after growth");
        small.write(10, b"y").expect("old mapping still valid");
        let mut buf = [0u8; 1];
        large.read(10, &mut buf).expect("read");
        assert_eq!(&buf, b"y");
    }

    #[test]
    fn misaligned_views_are_rejected() {
        let region = SharedRegion::anonymous(256).expect("anon");
        assert!(region.at::<AtomicU64>(4).is_err());
        assert!(region.at::<AtomicU64>(256).is_err());
        assert!(region.at::<AtomicU64>(248).is_ok());
    }
}
