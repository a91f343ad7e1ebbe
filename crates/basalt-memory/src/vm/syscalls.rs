//! Direct system-call wrappers used by the reservation layer.
//!
//! These bypass the standard library allocator entirely:
//!
//! - **Unix**: `mmap` / `mprotect` / `munmap` / `madvise`
//! - **Windows**: `VirtualAlloc` / `VirtualFree`
//!
//! # Safety
//!
//! Every function here is a thin FFI shim. The OS validates parameters and
//! reports failure through [`io::Error::last_os_error`], but callers remain
//! responsible for the usual mapping contracts: addresses and lengths are
//! page-granular, each mapping is unmapped exactly once, and no access
//! outside the committed protection.

use std::io;
use std::ptr::NonNull;

/// Page protection requested for a fresh mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemoryProtection {
    /// Address space only; any access faults until committed.
    None,
    /// Readable and writable.
    ReadWrite,
}

#[cfg(unix)]
impl MemoryProtection {
    fn to_unix_flags(self) -> i32 {
        match self {
            Self::None => libc::PROT_NONE,
            Self::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// Maps `len` bytes of anonymous private memory.
///
/// With [`MemoryProtection::None`] the range is reserved but not committed;
/// with [`MemoryProtection::ReadWrite`] it is immediately usable.
pub(crate) fn map(len: usize, protection: MemoryProtection) -> io::Result<NonNull<u8>> {
    #[cfg(unix)]
    {
        use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, mmap};

        // SAFETY: FFI call to mmap with a null hint (OS picks the address),
        // fd=-1 and offset=0 for an anonymous mapping. MAP_FAILED signals
        // failure; any other return is a valid mapping of `len` bytes.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                protection.to_unix_flags(),
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "mmap returned null"))
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE};

        let (alloc_type, page_protection) = match protection {
            MemoryProtection::None => (MEM_RESERVE, PAGE_NOACCESS),
            MemoryProtection::ReadWrite => (MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE),
        };

        // SAFETY: FFI call to VirtualAlloc with a null base (OS picks the
        // address). Returns null on failure.
        let ptr = unsafe {
            VirtualAlloc(
                std::ptr::null_mut(),
                len,
                alloc_type,
                page_protection,
            )
        };

        NonNull::new(ptr.cast::<u8>()).ok_or_else(io::Error::last_os_error)
    }
}

/// Makes `[addr, addr + len)` readable and writable.
///
/// # Safety
///
/// `addr` must be page-aligned and the range must lie inside a mapping
/// returned by [`map`].
pub(crate) unsafe fn commit_range(addr: *mut u8, len: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: caller guarantees the range lies within a live mapping.
        let result = unsafe {
            libc::mprotect(
                addr.cast::<libc::c_void>(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if result == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualAlloc;
        use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};

        // SAFETY: committing a sub-range of a reserved region; caller
        // guarantees the range was previously reserved.
        let ptr = unsafe {
            VirtualAlloc(
                addr.cast::<winapi::ctypes::c_void>(),
                len,
                MEM_COMMIT,
                PAGE_READWRITE,
            )
        };
        if ptr.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Unmaps an entire mapping previously returned by [`map`].
///
/// # Safety
///
/// `addr` and `len` must match the original mapping and the range must not
/// be accessed afterwards.
pub(crate) unsafe fn unmap(addr: *mut u8, len: usize) -> io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: caller guarantees addr/len came from map.
        let result = unsafe { libc::munmap(addr.cast::<libc::c_void>(), len) };
        if result == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    #[cfg(windows)]
    {
        use winapi::um::memoryapi::VirtualFree;
        use winapi::um::winnt::MEM_RELEASE;

        let _ = len; // MEM_RELEASE requires size 0 and frees the whole region.

        // SAFETY: caller guarantees addr came from VirtualAlloc.
        let result =
            unsafe { VirtualFree(addr.cast::<winapi::ctypes::c_void>(), 0, MEM_RELEASE) };
        if result == 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

/// Hints the kernel to back the range with transparent huge pages.
///
/// Advisory only; failures are ignored.
#[cfg(all(target_os = "linux", target_pointer_width = "64"))]
pub(crate) fn advise_huge_pages(addr: *mut u8, len: usize) {
    // SAFETY: madvise is a hint; an invalid range is rejected by the kernel
    // without affecting the mapping.
    unsafe {
        libc::madvise(addr.cast::<libc::c_void>(), len, libc::MADV_HUGEPAGE);
    }
}
