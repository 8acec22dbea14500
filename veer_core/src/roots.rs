//! Process-wide root set.
//!
//! A redirection roots both of its descriptors here for as long as it
//! lives, so the host's collector cannot reclaim them while their entry
//! addresses are being patched. The set has no ordering and no uniqueness:
//! a method redirected twice appears twice.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

static NEXT_TICKET: AtomicU64 = AtomicU64::new(1);
static ROOTS: Mutex<Vec<(u64, Box<dyn Any + Send>)>> = Mutex::new(Vec::new());

// =============================================================================
// RootTicket
// =============================================================================

/// Receipt for one rooted descriptor; redeeming it releases that entry.
#[derive(Debug)]
pub struct RootTicket(u64);

/// Root a descriptor. The boxed value is owned by the set until the
/// returned ticket is released.
pub(crate) fn retain<M: Send + 'static>(descriptor: M) -> RootTicket {
    let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
    ROOTS.lock().push((ticket, Box::new(descriptor)));
    RootTicket(ticket)
}

/// Release one previously rooted descriptor.
pub(crate) fn release(ticket: RootTicket) {
    let mut roots = ROOTS.lock();
    if let Some(pos) = roots.iter().position(|(id, _)| *id == ticket.0) {
        roots.swap_remove(pos);
    }
}

/// Number of descriptors currently rooted, process-wide.
pub fn live_roots() -> usize {
    ROOTS.lock().len()
}

/// Serialises tests that observe the process-wide set.
#[cfg(test)]
pub(crate) fn test_guard() -> parking_lot::MutexGuard<'static, ()> {
    static GUARD: Mutex<()> = Mutex::new(());
    GUARD.lock()
}

// =============================================================================
// Tests
// =============================================================================
