//! Platform memory broker.
//!
//! `allow_rw` makes the page(s) containing a patch window readable,
//! writable, and executable. On ARM hosts the operation is a no-op: the
//! targeted runtimes leave their code pages writable there, and the
//! aligned-`mprotect` dance is avoided entirely.

use crate::error::Result;
#[cfg(not(any(target_arch = "arm", target_arch = "aarch64")))]
use crate::error::Error;

// =============================================================================
// allow_rw
// =============================================================================

/// Guarantee that at least `len` bytes starting at `addr` are readable,
/// writable, and executable on return.
#[cfg(any(target_arch = "arm", target_arch = "aarch64"))]
pub fn allow_rw(_addr: *const u8, _len: usize) -> Result<()> {
    Ok(())
}

#[cfg(all(unix, not(any(target_arch = "arm", target_arch = "aarch64"))))]
pub fn allow_rw(addr: *const u8, len: usize) -> Result<()> {
    // SAFETY: sysconf is always safe to call with _SC_PAGESIZE.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let start = (addr as usize) & !(page_size - 1);
    let span = (addr as usize + len) - start;

    // SAFETY: the span covers mapped pages containing the patch window;
    // the caller hands us an address inside live code.
    let rc = unsafe {
        libc::mprotect(
            start as *mut libc::c_void,
            span,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(Error::MemoryProtect(os_error_code()));
    }
    Ok(())
}

#[cfg(all(windows, not(any(target_arch = "arm", target_arch = "aarch64"))))]
pub fn allow_rw(addr: *const u8, _len: usize) -> Result<()> {
    use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READWRITE, VirtualProtect};

    let mut old_protect: u32 = 0;
    // A one-byte length; the kernel widens the request to page granularity.
    // SAFETY: addr points into a mapped code region.
    let rc = unsafe {
        VirtualProtect(
            addr as *mut core::ffi::c_void,
            1,
            PAGE_EXECUTE_READWRITE,
            &mut old_protect,
        )
    };
    if rc == 0 {
        return Err(Error::MemoryProtect(os_error_code()));
    }
    Ok(())
}

#[cfg(not(any(
    unix,
    windows,
    target_arch = "arm",
    target_arch = "aarch64"
)))]
pub fn allow_rw(_addr: *const u8, _len: usize) -> Result<()> {
    Err(crate::error::Error::UnsupportedArchitecture)
}

/// Last OS error from the platform's error channel.
#[allow(dead_code)]
fn os_error_code() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(-1)
}

// =============================================================================
// Instruction-cache synchronisation
// =============================================================================

/// Make freshly written instruction bytes visible to the instruction
/// fetcher. x86 keeps its caches coherent; ARM64 needs an explicit
/// clean/invalidate pass.
#[cfg(not(target_arch = "aarch64"))]
#[inline]
pub fn sync_icache(_addr: *const u8, _len: usize) {}

#[cfg(target_arch = "aarch64")]
pub fn sync_icache(addr: *const u8, len: usize) {
    // Conservative 64-byte line size; over-flushing is harmless.
    const LINE: usize = 64;
    let start = (addr as usize) & !(LINE - 1);
    let end = addr as usize + len;

    unsafe {
        let mut p = start;
        while p < end {
            core::arch::asm!("dc cvau, {0}", in(reg) p);
            p += LINE;
        }
        core::arch::asm!("dsb ish");
        let mut p = start;
        while p < end {
            core::arch::asm!("ic ivau, {0}", in(reg) p);
            p += LINE;
        }
        core::arch::asm!("dsb ish", "isb");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(all(unix, not(any(target_arch = "arm", target_arch = "aarch64"))))]
    fn test_allow_rw_on_read_only_mapping() {
        use std::ptr;

        // SAFETY: fresh anonymous mapping, unmapped at the end of the test.
        unsafe {
            let page = libc::mmap(
                ptr::null_mut(),
                4096,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(page, libc::MAP_FAILED);

            let p = page as *mut u8;
            allow_rw(p.add(100), 16).expect("mprotect should succeed");
            // Writable now; this would fault without the protection change.
            p.add(100).write(0xAB);
            assert_eq!(p.add(100).read(), 0xAB);

            libc::munmap(page, 4096);
        }
    }

    #[test]
    #[cfg(all(unix, not(any(target_arch = "arm", target_arch = "aarch64"))))]
    fn test_allow_rw_spanning_page_boundary() {
        use std::ptr;

        // SAFETY: fresh two-page mapping, unmapped at the end of the test.
        unsafe {
            let pages = libc::mmap(
                ptr::null_mut(),
                8192,
                libc::PROT_READ,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            assert_ne!(pages, libc::MAP_FAILED);

            let p = pages as *mut u8;
            // A window straddling the page boundary must make both pages writable.
            allow_rw(p.add(4090), 12).expect("mprotect should succeed");
            p.add(4090).write(1);
            p.add(4100).write(2);

            libc::munmap(pages, 8192);
        }
    }
}
