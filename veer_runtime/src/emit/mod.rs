//! Template-JIT code emission.
//!
//! One page per body; bytes are emitted writable, then the buffer flips
//! executable. The host architecture picks the backend.

use crate::body::Body;
use crate::exec_mem::ExecutableBuffer;

#[cfg(target_arch = "aarch64")]
mod a64;
#[cfg(target_arch = "x86_64")]
mod x64;

/// Compile a body template into an executable buffer.
pub(crate) fn compile(body: &Body) -> ExecutableBuffer {
    let mut buf = ExecutableBuffer::new(64).expect("code page allocation failed");

    #[cfg(target_arch = "x86_64")]
    x64::emit(body, &mut buf);
    #[cfg(target_arch = "aarch64")]
    a64::emit(body, &mut buf);
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = body;
        panic!("the template JIT supports x86_64 and aarch64 hosts only");
    }

    assert!(buf.make_executable(), "code page protection flip failed");
    buf
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::body::{self, Helper};

    type Thunk = unsafe extern "C" fn(i64, i64) -> i64;

    fn run(body: Body, slot0: i64, slot1: i64) -> i64 {
        let buf = compile(&body);
        // SAFETY: `compile` emitted a complete body for this signature.
        let f: Thunk = unsafe { buf.as_fn() };
        unsafe { f(slot0, slot1) }
    }

    #[test]
    fn test_return_int() {
        assert_eq!(run(Body::ReturnInt(42), 0, 0), 42);
        assert_eq!(run(Body::ReturnInt(-1), 7, 7), -1);
        assert_eq!(run(Body::ReturnInt(i64::MIN), 0, 0), i64::MIN);
    }

    #[test]
    fn test_add_arg0() {
        assert_eq!(run(Body::AddArg0(1), 10, 99), 11);
        assert_eq!(run(Body::AddArg0(-1), 10, 99), 9);
    }

    #[test]
    fn test_add_arg1() {
        assert_eq!(run(Body::AddArg1(1), 99, 10), 11);
        assert_eq!(run(Body::AddArg1(-250), 99, 250), 0);
    }

    #[test]
    fn test_helper_raise_sets_flag() {
        body::clear_pending_raise();
        assert_eq!(run(Body::Helper(Helper::Raise), 0, 0), 0);
        assert!(body::take_pending_raise());
    }

    #[test]
    fn test_helper_clock_advances() {
        let t = run(Body::Helper(Helper::ClockMillis), 0, 0);
        // 2020-01-01T00:00:00Z.
        assert!(t > 1_577_836_800_000);
    }
}
