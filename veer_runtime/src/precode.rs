//! Precode stubs parked at method entries before compilation.
//!
//! A freshly defined method does not get native code; it gets a stub page
//! whose first bytes carry the architecture's precode shape. Regular
//! methods receive the stub form, dynamically emitted methods the fixup
//! form, so the classifier sees both shapes in the wild. The stub encodes
//! the method's table slot as its payload, the way a real runtime parks
//! the method-descriptor pointer there.

use crate::exec_mem::ExecutableBuffer;

/// Which precode shape to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PrecodeForm {
    /// The regular stub form.
    Stub,
    /// The fixup form.
    Fixup,
}

/// Build the stub page for a method occupying table slot `token`.
pub(crate) fn stub_page(form: PrecodeForm, token: usize) -> ExecutableBuffer {
    let mut buf = ExecutableBuffer::new(64).expect("stub page allocation failed");

    #[cfg(target_arch = "x86_64")]
    match form {
        PrecodeForm::Stub => {
            // mov r10, <token> ; jmp r10
            buf.emit_bytes(&[0x49, 0xBA]);
            buf.emit_u64(token as u64);
            buf.emit_bytes(&[0xFF, 0xE2]);
        }
        PrecodeForm::Fixup => {
            // jmp rel32 toward the fixup thunk, then the token.
            buf.emit_u8(0xE9);
            buf.emit_u32(0);
            buf.emit_bytes(&[0x90, 0x90, 0x90]);
            buf.emit_u64(token as u64);
        }
    }

    #[cfg(target_arch = "aarch64")]
    match form {
        PrecodeForm::Stub => {
            buf.emit_u32(0x1000_0089); // adr x9, #16
            buf.emit_u32(0xA940_312A); // ldp x10, x12, [x9]
            buf.emit_u32(0xD61F_0140); // br x10
            buf.emit_u32(0xD503_201F); // nop
            buf.emit_u64(token as u64);
        }
        PrecodeForm::Fixup => {
            buf.emit_u32(0x1000_000C); // adr x12, #0
            buf.emit_u32(0x5800_006B); // ldr x11, #12
            buf.emit_u32(0xD61F_0160); // br x11
            buf.emit_u32(0xD503_201F); // nop
            buf.emit_u64(token as u64);
        }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = (form, token);
        panic!("the template JIT supports x86_64 and aarch64 hosts only");
    }

    assert!(buf.make_executable(), "stub page protection flip failed");
    buf
}

// =============================================================================
// Tests
// =============================================================================
