//! Executable memory for template-JIT output and precode stubs.
//!
//! Each buffer is a page-aligned private mapping: writable while code is
//! being emitted, then flipped executable. On ARM64 hosts the flip keeps
//! the write permission: code pages stay writable there, which is the
//! behavior the patching layer's no-op memory broker relies on.

use std::ptr::NonNull;

// =============================================================================
// Platform-specific mapping
// =============================================================================

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate a read-write anonymous mapping.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, size: usize) {
        unsafe {
            libc::munmap(ptr as *mut _, size);
        }
    }

    /// Make the mapping executable. Execute-plus-read on x86; write
    /// permission is retained on ARM64.
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let prot = if cfg!(target_arch = "aarch64") {
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
        } else {
            libc::PROT_READ | libc::PROT_EXEC
        };
        unsafe { libc::mprotect(ptr as *mut _, size, prot) == 0 }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_READWRITE, VirtualAlloc, VirtualFree, VirtualProtect,
    };

    pub const PAGE_SIZE: usize = 4096;

    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        unsafe {
            VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
        }
    }

    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        unsafe {
            VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
        }
    }

    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let protect = if cfg!(target_arch = "aarch64") {
            PAGE_EXECUTE_READWRITE
        } else {
            PAGE_EXECUTE_READ
        };
        let mut old_protect = 0;
        unsafe { VirtualProtect(ptr as *mut _, size, protect, &mut old_protect) != 0 }
    }
}

pub use platform::PAGE_SIZE;

// =============================================================================
// Executable Buffer
// =============================================================================

/// A buffer of executable memory holding one method body or precode stub.
pub struct ExecutableBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    is_executable: bool,
}

impl ExecutableBuffer {
    /// Allocate a buffer of at least `min_capacity` bytes, rounded up to
    /// page granularity.
    pub fn new(min_capacity: usize) -> Option<Self> {
        let capacity = (min_capacity.max(1) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        // SAFETY: requesting a fresh private mapping.
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr)?;
        Some(Self {
            ptr,
            capacity,
            len: 0,
            is_executable: false,
        })
    }

    /// Bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Base address of the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Append one byte.
    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        assert!(!self.is_executable, "cannot write to executable buffer");
        assert!(self.len < self.capacity, "buffer overflow");
        // SAFETY: bounds asserted above.
        unsafe {
            self.ptr.as_ptr().add(self.len).write(byte);
        }
        self.len += 1;
    }

    /// Append a byte slice.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        assert!(!self.is_executable, "cannot write to executable buffer");
        assert!(self.len + bytes.len() <= self.capacity, "buffer overflow");
        // SAFETY: bounds asserted above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
    }

    /// Append a little-endian u32 (one instruction word on ARM64).
    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.emit_bytes(&val.to_le_bytes());
    }

    /// Append a little-endian u64.
    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.emit_bytes(&val.to_le_bytes());
    }

    /// Flip the buffer executable and publish the emitted instructions.
    pub fn make_executable(&mut self) -> bool {
        if self.is_executable {
            return true;
        }
        // SAFETY: the mapping covers `capacity` bytes.
        let ok = unsafe { platform::make_executable(self.ptr.as_ptr(), self.capacity) };
        if ok {
            veer_core::mem::sync_icache(self.ptr.as_ptr(), self.len);
            self.is_executable = true;
        }
        ok
    }

    /// Reinterpret the buffer base as a function pointer.
    ///
    /// # Safety
    /// The buffer must be executable and hold code valid for `F`.
    #[inline]
    pub unsafe fn as_fn<F: Copy>(&self) -> F {
        debug_assert!(self.is_executable, "buffer must be executable");
        debug_assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const ()>(),
            "F must be a function pointer"
        );
        // SAFETY: forwarded to the caller.
        unsafe { std::mem::transmute_copy(&self.ptr.as_ptr()) }
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        // SAFETY: the mapping was allocated with this capacity.
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// SAFETY: the mapping is process-global; synchronisation is managed by the
// owning method's state lock.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

// =============================================================================
// Tests
// =============================================================================
