//! The reflective surface a managed runtime must expose.
//!
//! Descriptors stay opaque: the library only learns what it asks for
//! through this trait, and it asks for exactly the operations the
//! redirection machinery needs: handle lookup, function pointers, JIT
//! preparation, type introspection for dummy arguments, and invocation.

use std::fmt;

// =============================================================================
// Handles and descriptor metadata
// =============================================================================

/// Opaque token for a method's runtime handle, as produced by the host's
/// reflection layer. Feeding it back to [`HostRuntime::function_pointer`]
/// yields the method's current entry address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodHandle(pub usize);

/// The descriptor sub-variants whose address-lookup paths differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Compiled from source; the handle is reachable through the
    /// descriptor's natural property.
    Regular,
    /// Constructed at runtime from an instruction builder; the handle
    /// hides behind non-public members.
    Dynamic,
    /// A constructor; dispatched through the host's construction facility
    /// when invoked without a receiver.
    Constructor,
}

/// One formal parameter: its type token and, if declared, a default value.
#[derive(Debug, Clone)]
pub struct Param<T, V> {
    /// The parameter's declared type.
    pub ty: T,
    /// The declared default value, when the signature carries one.
    pub default: Option<V>,
}

// =============================================================================
// InvokeError
// =============================================================================

/// Failure modes of the host's invocation facility.
///
/// The distinction matters: forced compilation swallows `Raised` (the call
/// only exists to push the method through the JIT) but always propagates
/// `Machinery`.
#[derive(Debug)]
pub enum InvokeError<E> {
    /// The invoked body threw.
    Raised(E),
    /// The invocation plumbing itself failed (bad arity, dead method, ...).
    Machinery(E),
}

impl<E: fmt::Display> fmt::Display for InvokeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Raised(e) => write!(f, "invoked body threw: {}", e),
            Self::Machinery(e) => write!(f, "invocation machinery failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for InvokeError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Raised(e) | Self::Machinery(e) => Some(e),
        }
    }
}

// =============================================================================
// HostRuntime
// =============================================================================

/// The managed runtime seen from the redirection library.
pub trait HostRuntime: Send + Sync {
    /// Opaque method descriptor.
    type Method: Clone + Send + 'static;
    /// Opaque type token.
    type Type: Copy + Send;
    /// Boxed runtime value.
    type Value: Clone;
    /// What invoked bodies throw.
    type Exception: std::error::Error + Send + Sync + 'static;

    // --- descriptor metadata -------------------------------------------------

    /// Which lookup path the descriptor needs.
    fn method_kind(&self, method: &Self::Method) -> MethodKind;

    /// Whether the method dispatches without a receiver.
    fn is_static(&self, method: &Self::Method) -> bool;

    /// The type the method is declared on.
    fn declaring_type(&self, method: &Self::Method) -> Self::Type;

    /// The method's formal parameters, in order.
    fn parameters(&self, method: &Self::Method) -> Vec<Param<Self::Type, Self::Value>>;

    // --- reflective handle access --------------------------------------------

    /// The descriptor's natural runtime-handle property. `None` for
    /// dynamically emitted methods, which do not expose it.
    fn method_handle(&self, method: &Self::Method) -> Option<MethodHandle>;

    /// Invoke a named non-public member method on the descriptor that
    /// returns its handle, if this runtime version has one.
    fn handle_from_member_method(
        &self,
        method: &Self::Method,
        name: &str,
    ) -> Option<MethodHandle>;

    /// Read a named non-public field of the descriptor holding its handle,
    /// if this runtime version has one.
    fn handle_from_member_field(&self, method: &Self::Method, name: &str)
        -> Option<MethodHandle>;

    /// The entry address behind a handle: the PC the CPU jumps to when the
    /// method is called through normal dispatch, at this moment.
    fn function_pointer(&self, handle: MethodHandle) -> *const u8;

    // --- JIT facility ---------------------------------------------------------

    /// Run the method through the JIT, if the host exposes such a facility.
    /// `None` means it does not and compilation must be forced by calling
    /// the method.
    fn prepare_method(&self, handle: MethodHandle) -> Option<bool>;

    // --- type introspection ----------------------------------------------------

    /// Whether values of the type are inline value types.
    fn is_value_type(&self, ty: Self::Type) -> bool;

    /// Whether the type cannot be instantiated.
    fn is_abstract(&self, ty: Self::Type) -> bool;

    /// A zeroed instance of a value type.
    fn zeroed_value(&self, ty: Self::Type) -> Self::Value;

    /// The null reference.
    fn null_value(&self) -> Self::Value;

    /// An instance allocated without running any constructor, if the host
    /// exposes that primitive.
    fn uninitialized_instance(&self, ty: Self::Type) -> Option<Self::Value>;

    /// All constructors declared on the type.
    fn constructors(&self, ty: Self::Type) -> Vec<Self::Method>;

    // --- invocation -------------------------------------------------------------

    /// Call the method through the host's standard invocation path. The
    /// call goes through the method's current entry bytes, so an installed
    /// trampoline is honored.
    fn invoke(
        &self,
        method: &Self::Method,
        receiver: Option<Self::Value>,
        args: &[Self::Value],
    ) -> Result<Self::Value, InvokeError<Self::Exception>>;

    /// Allocate an instance and run `ctor` on it, returning the instance.
    fn construct(
        &self,
        ctor: &Self::Method,
        args: &[Self::Value],
    ) -> Result<Self::Value, InvokeError<Self::Exception>>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invoke_error_display() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "overflow");
        let err: InvokeError<std::io::Error> = InvokeError::Raised(inner);
        assert!(format!("{}", err).contains("threw"));

        let inner = std::io::Error::new(std::io::ErrorKind::Other, "bad arity");
        let err: InvokeError<std::io::Error> = InvokeError::Machinery(inner);
        assert!(format!("{}", err).contains("machinery"));
    }

    #[test]
    fn test_method_handle_equality() {
        assert_eq!(MethodHandle(7), MethodHandle(7));
        assert_ne!(MethodHandle(7), MethodHandle(8));
    }
}
