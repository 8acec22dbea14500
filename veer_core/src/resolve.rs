//! Method-address resolution.
//!
//! Regular and constructor descriptors expose their runtime handle through
//! a natural property. Dynamically emitted methods do not; their handle is
//! dug out through non-public members whose names have varied across
//! runtime versions. The access path that works is probed once and then
//! memoised in a one-time-initialised cell, so every later dynamic lookup
//! goes straight through the cached accessor.

use std::sync::OnceLock;

use crate::error::{Error, Result};
use crate::host::{HostRuntime, MethodHandle, MethodKind};

/// Non-public member method returning the handle on newer runtimes.
const DESCRIPTOR_METHOD: &str = "GetMethodDescriptor";

/// Non-public handle fields, in the order runtime versions introduced them.
const HANDLE_FIELDS: [&str; 3] = ["m_method", "mhandle", "m_methodHandle"];

// =============================================================================
// Resolver
// =============================================================================

/// Which access path reaches a dynamic method's handle on this runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DynamicPath {
    /// The non-public descriptor-returning method.
    DescriptorMethod,
    /// One of the known non-public handle fields.
    Field(&'static str),
}

/// Resolves descriptors to entry addresses, memoising the dynamic-method
/// access path on first use.
#[derive(Debug, Default)]
pub struct Resolver {
    dynamic_path: OnceLock<DynamicPath>,
}

/// The process-wide resolver instance; one process runs one runtime
/// version, so the probed path is shared.
pub(crate) static RESOLVER: Resolver = Resolver::new();

impl Resolver {
    /// Create an empty resolver with no probed path.
    pub const fn new() -> Self {
        Self {
            dynamic_path: OnceLock::new(),
        }
    }

    /// The runtime handle behind a descriptor.
    pub fn handle_of<H: HostRuntime>(&self, host: &H, method: &H::Method) -> Result<MethodHandle> {
        match host.method_kind(method) {
            MethodKind::Regular | MethodKind::Constructor => host
                .method_handle(method)
                .ok_or(Error::ResolverUnavailable),
            MethodKind::Dynamic => self.dynamic_handle(host, method),
        }
    }

    /// The address of the first byte the CPU executes when the method is
    /// called, at this moment.
    pub fn address_of<H: HostRuntime>(&self, host: &H, method: &H::Method) -> Result<*const u8> {
        let handle = self.handle_of(host, method)?;
        Ok(host.function_pointer(handle))
    }

    fn dynamic_handle<H: HostRuntime>(&self, host: &H, method: &H::Method) -> Result<MethodHandle> {
        if let Some(path) = self.dynamic_path.get() {
            return self
                .follow(host, method, *path)
                .ok_or(Error::ResolverUnavailable);
        }

        if let Some(handle) = host.handle_from_member_method(method, DESCRIPTOR_METHOD) {
            tracing::debug!(member = DESCRIPTOR_METHOD, "dynamic handle path probed");
            let _ = self.dynamic_path.set(DynamicPath::DescriptorMethod);
            return Ok(handle);
        }
        for name in HANDLE_FIELDS {
            if let Some(handle) = host.handle_from_member_field(method, name) {
                tracing::debug!(field = name, "dynamic handle path probed");
                let _ = self.dynamic_path.set(DynamicPath::Field(name));
                return Ok(handle);
            }
        }
        Err(Error::ResolverUnavailable)
    }

    fn follow<H: HostRuntime>(
        &self,
        host: &H,
        method: &H::Method,
        path: DynamicPath,
    ) -> Option<MethodHandle> {
        match path {
            DynamicPath::DescriptorMethod => {
                host.handle_from_member_method(method, DESCRIPTOR_METHOD)
            }
            DynamicPath::Field(name) => host.handle_from_member_field(method, name),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockHost, MockReflection};
    use std::sync::Arc;

    #[test]
    fn test_regular_descriptor_uses_natural_property() {
        let host = Arc::new(MockHost::new());
        let m = host.define_static_int(7);
        let resolver = Resolver::new();
        let handle = resolver.handle_of(&*host, &m).unwrap();
        assert_eq!(host.function_pointer(handle), resolver.address_of(&*host, &m).unwrap());
    }

    #[test]
    fn test_dynamic_probes_member_method_first() {
        let host = Arc::new(MockHost::with_reflection(MockReflection::DescriptorMethod));
        let m = host.define_dynamic_int(1);
        let resolver = Resolver::new();
        assert!(resolver.handle_of(&*host, &m).is_ok());
        assert_eq!(host.member_method_probes(), 1);
        assert_eq!(host.member_field_probes(), 0);
    }

    #[test]
    fn test_dynamic_falls_back_to_fields() {
        let host = Arc::new(MockHost::with_reflection(MockReflection::Field("mhandle")));
        let m = host.define_dynamic_int(1);
        let resolver = Resolver::new();
        assert!(resolver.handle_of(&*host, &m).is_ok());
        // The member-method probe ran and failed before the field probes hit.
        assert_eq!(host.member_method_probes(), 1);
        assert!(host.member_field_probes() >= 1);
    }

    #[test]
    fn test_dynamic_path_is_memoised() {
        let host = Arc::new(MockHost::with_reflection(MockReflection::Field("mhandle")));
        let m1 = host.define_dynamic_int(1);
        let m2 = host.define_dynamic_int(2);
        let resolver = Resolver::new();
        resolver.handle_of(&*host, &m1).unwrap();
        let field_probes = host.member_field_probes();
        resolver.handle_of(&*host, &m2).unwrap();
        // Second lookup goes straight through the cached field accessor.
        assert_eq!(host.member_method_probes(), 1);
        assert_eq!(host.member_field_probes(), field_probes + 1);
    }

    #[test]
    fn test_unknown_layout_is_fatal() {
        let host = Arc::new(MockHost::with_reflection(MockReflection::None));
        let m = host.define_dynamic_int(1);
        let resolver = Resolver::new();
        assert!(matches!(
            resolver.handle_of(&*host, &m),
            Err(Error::ResolverUnavailable)
        ));
    }
}
