//! Architecture detection and the per-architecture patch geometry.
//!
//! The patch window is the number of bytes a redirection overwrites at a
//! method entry: exactly the length of the absolute-jump trampoline for
//! that architecture.

use crate::error::Result;

pub mod precode;
pub mod trampoline;

// =============================================================================
// Arch
// =============================================================================

/// CPU architectures the trampoline builder and precode classifier know.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// 64-bit x86.
    X64,
    /// 32-bit ARM (Thumb-2 precodes).
    Arm,
    /// 64-bit ARM.
    Arm64,
}

impl Arch {
    /// Detect the architecture this process is running on.
    pub fn current() -> Result<Self> {
        #[cfg(target_arch = "x86")]
        return Ok(Self::X86);
        #[cfg(target_arch = "x86_64")]
        return Ok(Self::X64);
        #[cfg(target_arch = "arm")]
        return Ok(Self::Arm);
        #[cfg(target_arch = "aarch64")]
        return Ok(Self::Arm64);
        #[cfg(not(any(
            target_arch = "x86",
            target_arch = "x86_64",
            target_arch = "arm",
            target_arch = "aarch64"
        )))]
        Err(crate::error::Error::UnsupportedArchitecture)
    }

    /// Number of bytes the trampoline occupies at a method entry.
    #[inline]
    pub const fn patch_size(self) -> usize {
        match self {
            Self::X86 => 6,
            Self::X64 => 12,
            Self::Arm => 8,
            Self::Arm64 => 16,
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
    fn test_patch_sizes() {
        assert_eq!(Arch::X86.patch_size(), 6);
        assert_eq!(Arch::X64.patch_size(), 12);
        assert_eq!(Arch::Arm.patch_size(), 8);
        assert_eq!(Arch::Arm64.patch_size(), 16);
    }

    #[test]
    #[cfg(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "arm",
        target_arch = "aarch64"
    ))]
    fn test_current_is_supported() {
        let arch = Arch::current().expect("host architecture should be supported");
        assert!(arch.patch_size() >= 6);
    }
}
