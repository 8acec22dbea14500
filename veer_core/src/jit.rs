//! JIT-state classification and forced compilation.
//!
//! A method entry either holds compiled native code or a runtime-installed
//! precode stub. Classification is a byte comparison against the stub
//! table; forcing compilation prefers the host's prepare facility and
//! falls back to invoking the method once with synthesised arguments.

use crate::arch::precode::StubPattern;
use crate::error::{Error, Result};
use crate::host::{HostRuntime, InvokeError, MethodKind, Param};
use crate::resolve::Resolver;

// =============================================================================
// Classification
// =============================================================================

/// Whether `entry` already holds compiled native code.
///
/// # Safety
/// `entry` must be readable for the widest pattern in `patterns`.
pub unsafe fn is_compiled(entry: *const u8, patterns: &[StubPattern]) -> bool {
    // SAFETY: forwarded to the caller.
    !patterns.iter().any(|p| unsafe { p.matches(entry) })
}

// =============================================================================
// Forced compilation
// =============================================================================

/// Force the method through the JIT.
///
/// Returns `Ok(false)` only when a receiver was required and every
/// constructor candidate was exhausted. Exceptions thrown by the method
/// body during the forcing call are swallowed (the call exists to make
/// the JIT run, not to be correct); failures of the invocation machinery
/// itself propagate.
pub fn try_prepare<H: HostRuntime>(host: &H, method: &H::Method) -> Result<bool> {
    try_prepare_with(&crate::resolve::RESOLVER, host, method)
}

pub(crate) fn try_prepare_with<H: HostRuntime>(
    resolver: &Resolver,
    host: &H,
    method: &H::Method,
) -> Result<bool> {
    let handle = resolver.handle_of(host, method)?;
    if let Some(prepared) = host.prepare_method(handle) {
        tracing::debug!(prepared, "prepare facility invoked");
        return Ok(prepared);
    }

    // No prepare facility: synthesise a call.
    let args = dummy_arguments(host, method);
    let receiver = if host.is_static(method) {
        None
    } else {
        match dummy_receiver(host, host.declaring_type(method))? {
            Some(receiver) => Some(receiver),
            None => return Ok(false),
        }
    };

    let outcome = match host.method_kind(method) {
        MethodKind::Constructor => host.construct(method, &args),
        _ => host.invoke(method, receiver, &args),
    };
    match outcome {
        Ok(_) => Ok(true),
        // The body ran (and therefore compiled); its exception is noise.
        Err(InvokeError::Raised(_)) => Ok(true),
        Err(InvokeError::Machinery(e)) => Err(Error::HostInvocation(Box::new(e))),
    }
}

/// Dummy values for each formal parameter: the declared default if present,
/// a zeroed instance for value types, the null reference otherwise.
fn dummy_arguments<H: HostRuntime>(host: &H, method: &H::Method) -> Vec<H::Value> {
    host.parameters(method)
        .into_iter()
        .map(|p| dummy_value(host, p))
        .collect()
}

fn dummy_value<H: HostRuntime>(host: &H, param: Param<H::Type, H::Value>) -> H::Value {
    if let Some(default) = param.default {
        default
    } else if host.is_value_type(param.ty) {
        host.zeroed_value(param.ty)
    } else {
        host.null_value()
    }
}

/// A receiver for an instance method: zeroed value types directly, then
/// the uninitialized-object primitive, then constructors by ascending
/// arity with dummy arguments. `None` when the type is abstract or every
/// constructor candidate failed.
fn dummy_receiver<H: HostRuntime>(host: &H, ty: H::Type) -> Result<Option<H::Value>> {
    if host.is_value_type(ty) {
        return Ok(Some(host.zeroed_value(ty)));
    }
    if host.is_abstract(ty) {
        return Ok(None);
    }
    if let Some(instance) = host.uninitialized_instance(ty) {
        return Ok(Some(instance));
    }

    let mut ctors = host.constructors(ty);
    ctors.sort_by_key(|c| host.parameters(c).len());
    for ctor in &ctors {
        let args = dummy_arguments(host, ctor);
        match host.construct(ctor, &args) {
            Ok(instance) => return Ok(Some(instance)),
            // A throwing or unusable constructor just moves us to the next
            // candidate.
            Err(_) => continue,
        }
    }
    Ok(None)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::precode;
    use crate::arch::Arch;
    use crate::mock::{MockHost, MockValue};
    use std::sync::Arc;

    #[test]
    fn test_is_compiled_rejects_stub() {
        let stub: [u8; 12] = [
            0x49, 0xBA, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xE2,
        ];
        let body: [u8; 12] = [
            0x48, 0xB8, 0x2A, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xE0,
        ];
        let table = precode::patterns(Arch::X64);
        assert!(!unsafe { is_compiled(stub.as_ptr(), table) });
        assert!(unsafe { is_compiled(body.as_ptr(), table) });
    }

    #[test]
    fn test_prepare_facility_preferred() {
        let host = Arc::new(MockHost::new());
        let m = host.define_uncompiled_static(5);
        assert!(try_prepare(&*host, &m).unwrap());
        assert_eq!(host.prepare_calls(), 1);
        assert_eq!(host.invocations(&m), 0);
    }

    #[test]
    fn test_fallback_invokes_with_dummy_arguments() {
        let host = Arc::new(MockHost::new().without_prepare());
        let default = MockValue::Int(99);
        let m = host.define_static_with_params(
            3,
            vec![
                (MockHost::INT, Some(default)),       // declared default wins
                (MockHost::INT, None),                // value type: zeroed
                (MockHost::object_type(), None),      // reference type: null
            ],
        );
        assert!(try_prepare(&*host, &m).unwrap());
        assert_eq!(host.invocations(&m), 1);
        let seen = host.last_arguments(&m);
        assert_eq!(
            seen,
            vec![MockValue::Int(99), MockValue::Int(0), MockValue::Null]
        );
    }

    #[test]
    fn test_fallback_swallows_raised_bodies() {
        let host = Arc::new(MockHost::new().without_prepare());
        let m = host.define_raising_static();
        assert!(try_prepare(&*host, &m).unwrap());
    }

    #[test]
    fn test_value_type_receiver_is_zeroed() {
        let host = Arc::new(MockHost::new().without_prepare());
        let m = host.define_instance_method(MockHost::INT, 1);
        assert!(try_prepare(&*host, &m).unwrap());
        assert_eq!(host.last_receiver(&m), Some(MockValue::Int(0)));
    }

    #[test]
    fn test_abstract_receiver_fails() {
        let host = Arc::new(MockHost::new().without_prepare());
        let ty = host.define_abstract_type();
        let m = host.define_instance_method(ty, 1);
        assert_eq!(try_prepare(&*host, &m).unwrap(), false);
        assert_eq!(host.invocations(&m), 0);
    }

    #[test]
    fn test_ctor_candidates_sorted_by_arity() {
        let host = Arc::new(
            MockHost::new()
                .without_prepare()
                .without_uninitialized(),
        );
        let ty = host.define_reference_type();
        host.define_ctor(ty, 2);
        let small = host.define_ctor(ty, 1);
        host.define_ctor(ty, 3);
        let m = host.define_instance_method(ty, 1);
        assert!(try_prepare(&*host, &m).unwrap());
        // Smallest arity constructor was the one used.
        assert_eq!(host.invocations(&small), 1);
    }

    #[test]
    fn test_ctor_exhaustion_returns_false() {
        let host = Arc::new(
            MockHost::new()
                .without_prepare()
                .without_uninitialized(),
        );
        let ty = host.define_reference_type();
        let m = host.define_instance_method(ty, 1);
        // No constructors at all: every candidate is exhausted.
        assert_eq!(try_prepare(&*host, &m).unwrap(), false);
    }

    #[test]
    fn test_machinery_failure_propagates() {
        let host = Arc::new(MockHost::new().without_prepare());
        let m = host.define_broken_static();
        assert!(matches!(
            try_prepare(&*host, &m),
            Err(Error::HostInvocation(_))
        ));
    }
}
