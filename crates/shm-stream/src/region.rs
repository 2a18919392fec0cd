//! POSIX shared memory region mapping.
//!
//! A [`SharedRegion`] is a caller-owned byte range that transports borrow.
//! Lifecycle follows the usual producer/consumer split:
//!
//! 1. One side creates the object with `shm_open(O_CREAT | O_EXCL)` and
//!    sizes it with `ftruncate`.
//! 2. Everyone maps it with `mmap(PROT_READ | PROT_WRITE, MAP_SHARED)`.
//! 3. Dropping a region unmaps it; `unlink` removes the named object and is
//!    always an explicit call, since transports must never tear down memory
//!    that another process may still be attached to.
//!
//! Same-process multi-thread tests use [`SharedRegion::anonymous`], which
//! maps `MAP_SHARED | MAP_ANONYMOUS` memory with the same semantics and no
//! name.
//!
//! # Naming
//!
//! POSIX names need a leading `/`; macOS caps them at 31 characters, so
//! names are derived as `/strata_` plus the first 8 characters of the tag.

use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mmap_anonymous, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::{debug, info, warn};

use crate::error::{ShmError, ShmResult};

/// Derive the shared memory object name for a tag (session id, test id, …).
pub fn region_name(tag: &str) -> String {
    let short = if tag.len() > 8 { &tag[..8] } else { tag };
    format!("/strata_{short}")
}

/// A mapped shared memory region.
///
/// The region is the single owning handle for the mapping; producer and
/// consumer sides share it through an `Arc`. Dropping unmaps, never unlinks.
pub struct SharedRegion {
    ptr: NonNull<libc::c_void>,
    len: usize,
    name: Option<String>,
    /// Keeps the descriptor alive for the mapping's lifetime (named regions).
    _file: Option<File>,
}

// SAFETY: The mapping is shared memory by construction; all concurrent
// access goes through atomics owned by the transports layered on top. The
// region itself only hands out the base pointer and length.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create and map a new named region (fails if the name exists).
    pub fn create(name: &str, len: usize) -> ShmResult<Arc<SharedRegion>> {
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ShmError::Region(format!("shm_open failed for {name:?}: {e}")))?;
        let file = File::from(fd);

        if let Err(e) = ftruncate(&file, len as libc::off_t) {
            let _ = shm_unlink(name);
            return Err(ShmError::Region(format!("ftruncate failed: {e}")));
        }

        let ptr = match Self::map(&file, len) {
            Ok(ptr) => ptr,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(e);
            }
        };

        info!(name = %name, len = %len, "created shared region");
        Ok(Arc::new(SharedRegion {
            ptr,
            len,
            name: Some(name.to_string()),
            _file: Some(file),
        }))
    }

    /// Open and map an existing named region, sized from the object itself.
    pub fn open(name: &str) -> ShmResult<Arc<SharedRegion>> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ShmError::Region(format!("shm_open failed for {name:?}: {e}")))?;
        let file = File::from(fd);
        let len = file
            .metadata()
            .map_err(|e| ShmError::Region(format!("stat failed for {name:?}: {e}")))?
            .len() as usize;
        if len == 0 {
            return Err(ShmError::Region(format!("region {name:?} has zero size")));
        }

        let ptr = Self::map(&file, len)?;
        debug!(name = %name, len = %len, "opened shared region");
        Ok(Arc::new(SharedRegion {
            ptr,
            len,
            name: Some(name.to_string()),
            _file: Some(file),
        }))
    }

    /// Map an anonymous shared region (same-process producer/consumer).
    pub fn anonymous(len: usize) -> ShmResult<Arc<SharedRegion>> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| ShmError::InvalidLayout("region length must be non-zero".into()))?;
        // SAFETY: fresh anonymous mapping, not backed by any caller pointer.
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|e| ShmError::Mmap(format!("anonymous mmap failed: {e}")))?;

        debug!(len = %len, "mapped anonymous shared region");
        Ok(Arc::new(SharedRegion {
            ptr,
            len,
            name: None,
            _file: None,
        }))
    }

    fn map(file: &File, len: usize) -> ShmResult<NonNull<libc::c_void>> {
        let size = NonZeroUsize::new(len)
            .ok_or_else(|| ShmError::InvalidLayout("region length must be non-zero".into()))?;
        // SAFETY: mapping a descriptor we own for its full length.
        unsafe {
            mmap(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file,
                0,
            )
        }
        .map_err(|e| ShmError::Mmap(format!("mmap failed: {e}")))
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name of the backing object, if the region is named.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Remove the named object. Existing mappings stay valid; new opens
    /// fail. Call from the creating side once consumers are done.
    pub fn unlink(&self) -> ShmResult<()> {
        let Some(name) = &self.name else {
            return Ok(());
        };
        match shm_unlink(name.as_str()) {
            Ok(()) => Ok(()),
            // Already unlinked is fine
            Err(nix::errno::Errno::ENOENT) => Ok(()),
            Err(e) => Err(ShmError::Region(format!("shm_unlink failed: {e}"))),
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: pointer and length came from our own successful mmap, and
        // this is the only place the mapping is released.
        if let Err(e) = unsafe { munmap(self.ptr, self.len) } {
            warn!(name = ?self.name, error = %e, "munmap failed");
        }
    }
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_name_fits_macos_limit() {
        let name = region_name("12345678-1234-1234-1234-123456789012");
        assert_eq!(name, "/strata_12345678");
        assert!(name.len() <= 31);
        assert_eq!(region_name("ab"), "/strata_ab");
    }

    #[test]
    fn test_anonymous_region_is_zeroed_and_writable() {
        let region = SharedRegion::anonymous(4096).unwrap();
        assert_eq!(region.len(), 4096);
        assert!(region.name().is_none());

        // Fresh anonymous pages read as zero and accept writes
        let bytes = unsafe { std::slice::from_raw_parts_mut(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[0] = 0xaa;
        bytes[4095] = 0x55;
        assert_eq!(bytes[0], 0xaa);
    }

    #[test]
    fn test_named_region_create_open_unlink() {
        let tag = uuid::Uuid::new_v4().to_string();
        let name = region_name(&tag);

        let created = SharedRegion::create(&name, 8192).unwrap();
        let opened = SharedRegion::open(&name).unwrap();
        assert_eq!(opened.len(), 8192);

        // Creating over an existing name fails
        assert!(SharedRegion::create(&name, 8192).is_err());

        // Writes through one mapping are visible through the other
        unsafe {
            *created.as_ptr() = 42;
            assert_eq!(*opened.as_ptr(), 42);
        }

        created.unlink().unwrap();
        // Unlink twice is a no-op
        created.unlink().unwrap();
        assert!(SharedRegion::open(&name).is_err());
    }

    #[test]
    fn test_zero_length_region_rejected() {
        assert!(matches!(
            SharedRegion::anonymous(0),
            Err(ShmError::InvalidLayout(_))
        ));
    }
}
