//! Platform probes shared by the reservation layer.

use std::sync::LazyLock;

static PAGE_SIZE: LazyLock<usize> = LazyLock::new(probe_page_size);

/// System page size, captured once per process.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn probe_page_size() -> usize {
            // SAFETY: sysconf has no memory-safety preconditions.
            let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if size > 0 { size as usize } else { 4096 }
        }
    } else if #[cfg(windows)] {
        fn probe_page_size() -> usize {
            use winapi::um::sysinfoapi::{GetSystemInfo, SYSTEM_INFO};
            // SAFETY: GetSystemInfo fills the zeroed out-param in place.
            unsafe {
                let mut system_info: SYSTEM_INFO = std::mem::zeroed();
                GetSystemInfo(&mut system_info);
                system_info.dwPageSize as usize
            }
        }
    } else {
        fn probe_page_size() -> usize {
            4096
        }
    }
}
