//! Absolute-jump trampolines.
//!
//! Each builder produces the shortest position-independent absolute branch
//! to a destination for one architecture. The builders are plain byte
//! constructors so every encoding is unit-testable on any host.

use smallvec::SmallVec;

use super::Arch;

/// A patch image: the byte sequence written over (or captured from) a
/// method entry. Never longer than the largest patch window.
pub type PatchImage = SmallVec<[u8; 16]>;

// =============================================================================
// Per-architecture builders
// =============================================================================

/// x86: `push imm32 / ret`.
#[inline]
pub fn jmp_x86(dest: u32) -> [u8; 6] {
    let d = dest.to_le_bytes();
    [0x68, d[0], d[1], d[2], d[3], 0xC3]
}

/// x86-64: `mov rax, imm64 / jmp rax`.
#[inline]
pub fn jmp_x64(dest: u64) -> [u8; 12] {
    let mut bytes = [0u8; 12];
    bytes[0] = 0x48;
    bytes[1] = 0xB8;
    bytes[2..10].copy_from_slice(&dest.to_le_bytes());
    bytes[10] = 0xFF;
    bytes[11] = 0xE0;
    bytes
}

/// ARM: `ldr pc, [pc, #-4]` followed by the literal destination.
///
/// The A32 PC reads as the instruction address plus 8, so `[pc, #-4]`
/// addresses the word immediately after the instruction.
#[inline]
pub fn jmp_arm(dest: u32) -> [u8; 8] {
    let mut bytes = [0u8; 8];
    bytes[..4].copy_from_slice(&0xE51F_F004u32.to_le_bytes());
    bytes[4..].copy_from_slice(&dest.to_le_bytes());
    bytes
}

/// ARM64: `ldr x17, #8 / br x17` followed by the literal destination.
///
/// x17 is the intra-procedure-call scratch register and may be clobbered
/// at any entry point.
#[inline]
pub fn jmp_arm64(dest: u64) -> [u8; 16] {
    // LDR (literal, 64-bit): imm19 = 2 words ahead, Rt = x17.
    const LDR_X17_PC8: u32 = 0x5800_0051;
    const BR_X17: u32 = 0xD61F_0220;
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&LDR_X17_PC8.to_le_bytes());
    bytes[4..8].copy_from_slice(&BR_X17.to_le_bytes());
    bytes[8..].copy_from_slice(&dest.to_le_bytes());
    bytes
}

// =============================================================================
// Dispatch
// =============================================================================

/// Build the absolute jump to `dest` for `arch`.
///
/// The returned image is exactly `arch.patch_size()` bytes long.
pub fn jmp_bytes(arch: Arch, dest: usize) -> PatchImage {
    let mut image = PatchImage::new();
    match arch {
        Arch::X86 => image.extend_from_slice(&jmp_x86(dest as u32)),
        Arch::X64 => image.extend_from_slice(&jmp_x64(dest as u64)),
        Arch::Arm => image.extend_from_slice(&jmp_arm(dest as u32)),
        Arch::Arm64 => image.extend_from_slice(&jmp_arm64(dest as u64)),
    }
    debug_assert_eq!(image.len(), arch.patch_size());
    image
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jmp_x86_encoding() {
        assert_eq!(
            jmp_x86(0x1122_3344),
            [0x68, 0x44, 0x33, 0x22, 0x11, 0xC3]
        );
    }

    #[test]
    fn test_jmp_x64_encoding() {
        assert_eq!(
            jmp_x64(0xDEAD_BEEF_CAFE_BABE),
            [0x48, 0xB8, 0xBE, 0xBA, 0xFE, 0xCA, 0xEF, 0xBE, 0xAD, 0xDE, 0xFF, 0xE0]
        );
    }

    #[test]
    fn test_jmp_arm_encoding() {
        let bytes = jmp_arm(0x0040_1000);
        assert_eq!(&bytes[..4], &[0x04, 0xF0, 0x1F, 0xE5]);
        assert_eq!(&bytes[4..], &0x0040_1000u32.to_le_bytes());
    }

    #[test]
    fn test_jmp_arm64_encoding() {
        let bytes = jmp_arm64(0x0000_7F00_1234_5678);
        // ldr x17, #8
        assert_eq!(&bytes[..4], &[0x51, 0x00, 0x00, 0x58]);
        // br x17
        assert_eq!(&bytes[4..8], &[0x20, 0x02, 0x1F, 0xD6]);
        assert_eq!(&bytes[8..], &0x0000_7F00_1234_5678u64.to_le_bytes());
    }

    #[test]
    fn test_image_lengths_match_patch_sizes() {
        for arch in [Arch::X86, Arch::X64, Arch::Arm, Arch::Arm64] {
            assert_eq!(jmp_bytes(arch, 0x1000).len(), arch.patch_size());
        }
    }
}
