//! Template method bodies.
//!
//! The template JIT does not compile a language; it compiles one of a
//! small set of body shapes into native code. The shapes are enough to
//! express the behaviors the redirection machinery cares about: returning
//! constants, arithmetic on an argument, and calling back into the
//! runtime (to throw, or to read the clock).

use std::cell::Cell;
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// Body
// =============================================================================

/// A method body template. All bodies use the uniform native signature
/// `extern "C" fn(i64, i64) -> i64`: slot 0 carries the receiver for
/// instance methods (the first argument for static ones), slot 1 the next
/// argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    /// Return the constant, ignoring both slots.
    ReturnInt(i64),
    /// Return slot 0 plus the constant.
    AddArg0(i64),
    /// Return slot 1 plus the constant.
    AddArg1(i64),
    /// Call a runtime helper and return its result.
    Helper(Helper),
}

/// Runtime helpers callable from emitted code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Helper {
    /// Flag a pending exception and return zero; models a throwing body.
    Raise,
    /// Current wall-clock time in milliseconds since the Unix epoch.
    ClockMillis,
}

impl Helper {
    /// Address of the helper's native entry.
    #[inline]
    pub(crate) fn address(self) -> usize {
        match self {
            Helper::Raise => helper_raise as usize,
            Helper::ClockMillis => helper_clock_millis as usize,
        }
    }
}

// =============================================================================
// Helper implementations
// =============================================================================

thread_local! {
    static PENDING_RAISE: Cell<bool> = const { Cell::new(false) };
}

/// Clear the pending-exception flag before dispatching a call.
pub(crate) fn clear_pending_raise() {
    PENDING_RAISE.with(|flag| flag.set(false));
}

/// Consume the pending-exception flag after a call returns.
pub(crate) fn take_pending_raise() -> bool {
    PENDING_RAISE.with(|flag| flag.replace(false))
}

extern "C" fn helper_raise() -> i64 {
    PENDING_RAISE.with(|flag| flag.set(true));
    0
}

extern "C" fn helper_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_flag_roundtrip() {
        clear_pending_raise();
        assert!(!take_pending_raise());
        helper_raise();
        assert!(take_pending_raise());
        // Consumed.
        assert!(!take_pending_raise());
    }

    #[test]
    fn test_clock_is_past_2020() {
        // 2020-01-01T00:00:00Z in milliseconds.
        assert!(helper_clock_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_helper_addresses_distinct() {
        assert_ne!(Helper::Raise.address(), Helper::ClockMillis.address());
        assert_ne!(Helper::Raise.address(), 0);
    }
}
