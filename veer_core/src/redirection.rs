//! The redirection object.
//!
//! A `Redirection` rewrites the first bytes of one compiled method's body
//! with an absolute jump to another's, keeps the overwritten bytes for
//! restore, and roots both descriptors for as long as it lives. Arming and
//! disarming just toggles which byte image sits at the original entry.
//!
//! The byte copy is not atomic at instruction granularity; callers must
//! quiesce the patched method (or accept torn reads) around `start`,
//! `stop`, `invoke_original`, and disposal.

use std::ptr;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::arch::trampoline::{self, PatchImage};
use crate::arch::{precode, Arch};
use crate::error::{Error, Result};
use crate::host::{HostRuntime, MethodKind};
use crate::resolve::RESOLVER;
use crate::roots::{self, RootTicket};
use crate::{jit, mem};

// =============================================================================
// Redirection
// =============================================================================

/// A reversible redirection of one compiled method to another.
pub struct Redirection<H: HostRuntime> {
    host: Arc<H>,
    original: H::Method,
    replacement: H::Method,
    /// The patched entry: the original method's first executable byte.
    entry: *mut u8,
    /// Bytes found at the entry before the first patch.
    captured: PatchImage,
    /// The absolute jump to the replacement's entry.
    trampoline: PatchImage,
    active: bool,
    disposed: bool,
    tickets: Option<(RootTicket, RootTicket)>,
}

// SAFETY: the raw entry pointer refers to process-global code memory, not
// to thread-local state; every field is otherwise Send. The type is
// deliberately not Sync; operations are unsynchronised by contract.
unsafe impl<H: HostRuntime> Send for Redirection<H> {}

impl<H: HostRuntime> std::fmt::Debug for Redirection<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Redirection")
            .field("entry", &self.entry)
            .field("captured", &self.captured)
            .field("trampoline", &self.trampoline)
            .field("active", &self.active)
            .field("disposed", &self.disposed)
            .field("tickets", &self.tickets)
            .finish()
    }
}

impl<H: HostRuntime> Redirection<H> {
    /// Build a redirection from `original` to `replacement`, forcing both
    /// through the JIT if needed, and arm it immediately when `start` is
    /// set.
    ///
    /// On failure nothing is left behind: no patch, no root-set entries.
    pub fn create(
        host: Arc<H>,
        original: H::Method,
        replacement: H::Method,
        start: bool,
    ) -> Result<Self> {
        let arch = Arch::current()?;
        let patch_size = arch.patch_size();

        // Cheap rejection on the pre-compilation addresses.
        let src = RESOLVER.address_of(&*host, &original)?;
        let dst = RESOLVER.address_of(&*host, &replacement)?;
        if src == dst {
            return Err(Error::SelfRedirect);
        }

        // Both bodies must exist before they can be patched or jumped to.
        // Preparation can move an entry, so the invariants are enforced on
        // the addresses that will actually be used.
        let src = ensure_compiled(&*host, &original, arch)? as *mut u8;
        let dst = ensure_compiled(&*host, &replacement, arch)?;
        if src as *const u8 == dst {
            return Err(Error::SelfRedirect);
        }
        let distance = (src as usize).abs_diff(dst as usize);
        if distance <= patch_size {
            return Err(Error::BodiesTooClose {
                distance,
                patch_size,
            });
        }

        mem::allow_rw(src, patch_size)?;

        let trampoline = trampoline::jmp_bytes(arch, dst as usize);
        let mut captured = PatchImage::new();
        // SAFETY: `src` is a compiled entry readable for at least one patch
        // window, and `allow_rw` succeeded.
        captured.extend_from_slice(unsafe { std::slice::from_raw_parts(src, patch_size) });

        tracing::debug!(
            entry = src as usize,
            target = dst as usize,
            patch_size,
            armed = start,
            "redirection created"
        );

        let tickets = (
            roots::retain(original.clone()),
            roots::retain(replacement.clone()),
        );
        let mut redirection = Self {
            host,
            original,
            replacement,
            entry: src,
            captured,
            trampoline,
            active: false,
            disposed: false,
            tickets: Some(tickets),
        };
        if start {
            redirection.start();
        }
        Ok(redirection)
    }

    /// Install the trampoline. Idempotent.
    pub fn start(&mut self) {
        if !self.active {
            // SAFETY: `entry` was made writable at construction and stays
            // valid while the descriptors are rooted.
            unsafe { install(self.entry, &self.trampoline) };
            self.active = true;
            tracing::trace!(entry = self.entry as usize, "redirection armed");
        }
    }

    /// Restore the captured bytes. Idempotent.
    pub fn stop(&mut self) {
        if self.active {
            // SAFETY: as in `start`.
            unsafe { install(self.entry, &self.captured) };
            self.active = false;
            tracing::trace!(entry = self.entry as usize, "redirection disarmed");
        }
    }

    /// Whether the trampoline is currently installed.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The patched entry address.
    #[inline]
    pub fn entry_point(&self) -> *const u8 {
        self.entry
    }

    /// The original method's descriptor.
    #[inline]
    pub fn original(&self) -> &H::Method {
        &self.original
    }

    /// The replacement method's descriptor.
    #[inline]
    pub fn replacement(&self) -> &H::Method {
        &self.replacement
    }

    /// The byte image captured before the first patch.
    #[inline]
    pub fn captured_bytes(&self) -> &[u8] {
        &self.captured
    }

    /// The trampoline image written while armed.
    #[inline]
    pub fn trampoline_bytes(&self) -> &[u8] {
        &self.trampoline
    }

    /// Call the original method, un-patching around the call when the
    /// redirection is armed. The trampoline is re-installed on every exit
    /// path, including unwinding; exceptions thrown by the body propagate
    /// after the re-patch.
    pub fn invoke_original(
        &self,
        receiver: Option<H::Value>,
        args: &[H::Value],
    ) -> Result<H::Value> {
        let _repatch = if self.active {
            // SAFETY: as in `start`.
            unsafe { install(self.entry, &self.captured) };
            Some(Repatch {
                entry: self.entry,
                image: &self.trampoline,
            })
        } else {
            None
        };

        let outcome = match self.host.method_kind(&self.original) {
            MethodKind::Constructor if receiver.is_none() => {
                self.host.construct(&self.original, args)
            }
            _ => self.host.invoke(&self.original, receiver, args),
        };
        outcome.map_err(|e| Error::HostInvocation(Box::new(e)))
    }

    /// Disarm and release both descriptors from the root set. The record
    /// is consumed; dropping a redirection performs the same teardown.
    pub fn dispose(mut self) {
        self.dispose_inner();
    }

    fn dispose_inner(&mut self) {
        if self.disposed {
            return;
        }
        self.stop();
        if let Some((original, replacement)) = self.tickets.take() {
            roots::release(original);
            roots::release(replacement);
        }
        self.disposed = true;
        tracing::debug!(entry = self.entry as usize, "redirection disposed");
    }
}

impl<H: HostRuntime> Drop for Redirection<H> {
    fn drop(&mut self) {
        self.dispose_inner();
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolve the method's entry, forcing compilation when the entry still
/// holds a precode stub, and re-resolving afterwards.
fn ensure_compiled<H: HostRuntime>(host: &H, method: &H::Method, arch: Arch) -> Result<*const u8> {
    let patterns = precode::patterns(arch);
    let entry = RESOLVER.address_of(host, method)?;
    // SAFETY: a resolved entry is readable for at least one patch window.
    if unsafe { jit::is_compiled(entry, patterns) } {
        return Ok(entry);
    }
    if !jit::try_prepare(host, method)? {
        return Err(Error::NotJitted);
    }
    let entry = RESOLVER.address_of(host, method)?;
    // SAFETY: as above.
    if !unsafe { jit::is_compiled(entry, patterns) } {
        return Err(Error::NotJitted);
    }
    Ok(entry)
}

/// Copy a byte image over an entry and publish it.
///
/// # Safety
/// `entry` must be writable for `image.len()` bytes.
unsafe fn install(entry: *mut u8, image: &[u8]) {
    // SAFETY: forwarded to the caller.
    unsafe { ptr::copy_nonoverlapping(image.as_ptr(), entry, image.len()) };
    fence(Ordering::SeqCst);
    mem::sync_icache(entry, image.len());
}

/// Re-installs the trampoline when dropped, whatever the exit path.
struct Repatch<'a> {
    entry: *mut u8,
    image: &'a [u8],
}

impl Drop for Repatch<'_> {
    fn drop(&mut self) {
        // SAFETY: the entry was writable when the guard was created.
        unsafe { install(self.entry, self.image) };
    }
}

// =============================================================================
// Tests
// =============================================================================
