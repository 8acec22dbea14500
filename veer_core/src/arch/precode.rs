//! Precode stub shapes.
//!
//! The host runtime parks a small stub at a method entry until the JIT has
//! produced native code. A body is considered compiled when none of the
//! stub shapes for the architecture match its first bytes.
//!
//! The patterns are empirical, taken from one runtime revision, and drift
//! across versions; they are data, not code. `patterns()` returns the
//! built-in table and callers tracking a different revision substitute
//! their own.

use super::Arch;

// =============================================================================
// StubPattern
// =============================================================================

/// One recognisable stub shape: `bytes` expected at `offset` from the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubPattern {
    /// Byte offset from the method entry at which the pattern sits.
    pub offset: usize,
    /// The bytes as they appear in memory (little-endian instruction words).
    pub bytes: &'static [u8],
}

impl StubPattern {
    /// Check whether this pattern is present at `entry`.
    ///
    /// # Safety
    /// `entry` must be readable for `offset + bytes.len()` bytes.
    #[inline]
    pub unsafe fn matches(&self, entry: *const u8) -> bool {
        let at = unsafe { entry.add(self.offset) };
        self.bytes
            .iter()
            .enumerate()
            // SAFETY: caller guarantees the span is readable.
            .all(|(i, &b)| unsafe { at.add(i).read() } == b)
    }
}

// =============================================================================
// Built-in tables
// =============================================================================

// mov eax, imm32 marker at offset 5.
const X86_STUB: StubPattern = StubPattern {
    offset: 5,
    bytes: &[0xB8],
};

// mov r10, imm64 marker.
const X64_STUB: StubPattern = StubPattern {
    offset: 0,
    bytes: &[0x49, 0xBA],
};

// Relative jmp fixup form, shared by i386 and x86-64.
const X86_FIXUP: StubPattern = StubPattern {
    offset: 0,
    bytes: &[0xE9],
};

// ldr.w r12, [pc, #8] / ldr.w pc, [pc, #0] (Thumb-2 halfwords F8DF C008 F8DF F000).
const ARM_STUB: StubPattern = StubPattern {
    offset: 0,
    bytes: &[0xDF, 0xF8, 0x08, 0xC0, 0xDF, 0xF8, 0x00, 0xF0],
};

// mov r12, pc / ldr.w pc, [pc, #4] fixup form (46FC F8DF F004).
const ARM_FIXUP: StubPattern = StubPattern {
    offset: 0,
    bytes: &[0xFC, 0x46, 0xDF, 0xF8, 0x04, 0xF0],
};

// adr x9 / ldp x10, x12 / br x10, stored as little-endian words.
const ARM64_STUB: StubPattern = StubPattern {
    offset: 0,
    bytes: &[
        0x89, 0x00, 0x00, 0x10, 0x2A, 0x31, 0x40, 0xA9, 0x40, 0x01, 0x1F, 0xD6,
    ],
};

// adr x12 / ldr x11 / br x11 fixup form.
const ARM64_FIXUP: StubPattern = StubPattern {
    offset: 0,
    bytes: &[
        0x0C, 0x00, 0x00, 0x10, 0x6B, 0x00, 0x00, 0x58, 0x60, 0x01, 0x1F, 0xD6,
    ],
};

static X86_TABLE: [StubPattern; 2] = [X86_STUB, X86_FIXUP];
static X64_TABLE: [StubPattern; 2] = [X64_STUB, X86_FIXUP];
static ARM_TABLE: [StubPattern; 2] = [ARM_STUB, ARM_FIXUP];
static ARM64_TABLE: [StubPattern; 2] = [ARM64_STUB, ARM64_FIXUP];

/// The built-in stub table for `arch`: the regular stub form first, the
/// fixup form second.
pub fn patterns(arch: Arch) -> &'static [StubPattern] {
    match arch {
        Arch::X86 => &X86_TABLE,
        Arch::X64 => &X64_TABLE,
        Arch::Arm => &ARM_TABLE,
        Arch::Arm64 => &ARM64_TABLE,
    }
}

/// The regular stub form for `arch` (what a freshly defined method entry
/// carries).
pub fn stub_pattern(arch: Arch) -> &'static StubPattern {
    &patterns(arch)[0]
}

/// The fixup form for `arch`.
pub fn fixup_pattern(arch: Arch) -> &'static StubPattern {
    &patterns(arch)[1]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x64_stub_matches() {
        let body: [u8; 12] = [
            0x49, 0xBA, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xE2,
        ];
        assert!(unsafe { X64_STUB.matches(body.as_ptr()) });
        assert!(!unsafe { X86_FIXUP.matches(body.as_ptr()) });
    }

    #[test]
    fn test_fixup_matches_relative_jmp() {
        let body: [u8; 8] = [0xE9, 0x10, 0x20, 0x30, 0x40, 0x90, 0x90, 0x90];
        assert!(unsafe { X86_FIXUP.matches(body.as_ptr()) });
    }

    #[test]
    fn test_x86_stub_offset() {
        // call-style prologue with the mov eax marker at offset 5.
        let body: [u8; 8] = [0xE8, 0x00, 0x00, 0x00, 0x00, 0xB8, 0x00, 0x00];
        assert!(unsafe { X86_STUB.matches(body.as_ptr()) });
        let compiled: [u8; 8] = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x08, 0x90, 0x90];
        assert!(!unsafe { X86_STUB.matches(compiled.as_ptr()) });
    }

    #[test]
    fn test_arm64_patterns_distinct() {
        let stub = ARM64_STUB.bytes;
        assert!(unsafe { ARM64_STUB.matches(stub.as_ptr()) });
        assert!(!unsafe { ARM64_FIXUP.matches(stub.as_ptr()) });
    }

    #[test]
    fn test_tables_carry_both_forms() {
        for arch in [Arch::X86, Arch::X64, Arch::Arm, Arch::Arm64] {
            assert_eq!(patterns(arch).len(), 2);
            assert_eq!(&patterns(arch)[0], stub_pattern(arch));
            assert_eq!(&patterns(arch)[1], fixup_pattern(arch));
        }
    }
}
