//! Error taxonomy for redirection construction and use.
//!
//! Every failure is surfaced to the calling frame; nothing is retried or
//! logged-and-dropped internally.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Error
// =============================================================================

/// Errors produced while constructing or driving a redirection.
#[derive(Debug)]
pub enum Error {
    /// Original and replacement resolve to the same entry point.
    SelfRedirect,
    /// The two entry points are within one patch window of each other;
    /// writing the trampoline would clobber its own destination.
    BodiesTooClose {
        /// Absolute distance between the two entries, in bytes.
        distance: usize,
        /// Patch window for the current architecture.
        patch_size: usize,
    },
    /// A method could not be forced through the JIT.
    NotJitted,
    /// The current CPU architecture is not supported.
    UnsupportedArchitecture,
    /// A page-protection change failed; carries the OS error code.
    MemoryProtect(i32),
    /// None of the known reflective access paths succeeded for this
    /// runtime version.
    ResolverUnavailable,
    /// The host's invocation facility reported a failure, or an explicitly
    /// invoked body threw. Surfaced unchanged.
    HostInvocation(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfRedirect => {
                write!(f, "original and replacement share one entry point")
            }
            Self::BodiesTooClose {
                distance,
                patch_size,
            } => write!(
                f,
                "method bodies are {} bytes apart, inside the {}-byte patch window",
                distance, patch_size
            ),
            Self::NotJitted => write!(f, "method could not be forced through the JIT"),
            Self::UnsupportedArchitecture => write!(f, "unsupported CPU architecture"),
            Self::MemoryProtect(code) => {
                write!(f, "page protection change failed (OS error {})", code)
            }
            Self::ResolverUnavailable => {
                write!(f, "no reflective access path to the method handle")
            }
            Self::HostInvocation(e) => write!(f, "host invocation failed: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::HostInvocation(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_self_redirect() {
        let msg = format!("{}", Error::SelfRedirect);
        assert!(msg.contains("entry point"));
    }

    #[test]
    fn test_display_bodies_too_close() {
        let err = Error::BodiesTooClose {
            distance: 4,
            patch_size: 12,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("4 bytes"));
        assert!(msg.contains("12-byte"));
    }

    #[test]
    fn test_display_memory_protect_carries_code() {
        let msg = format!("{}", Error::MemoryProtect(13));
        assert!(msg.contains("13"));
    }

    #[test]
    fn test_source_chains_host_error() {
        use std::error::Error as _;
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::HostInvocation(Box::new(inner));
        assert!(err.source().is_some());
        assert!(Error::NotJitted.source().is_none());
    }
}
