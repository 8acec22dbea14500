//! x86-64 backend for the template JIT.
//!
//! Calling convention differences are confined to which registers carry
//! the two slots: rdi/rsi on the System V ABI, rcx/rdx on Windows.

use crate::body::Body;
use crate::exec_mem::ExecutableBuffer;

/// Emit a complete body for `extern "C" fn(i64, i64) -> i64`.
pub(crate) fn emit(body: &Body, buf: &mut ExecutableBuffer) {
    match *body {
        Body::ReturnInt(value) => {
            emit_mov_rax_imm64(buf, value as u64);
            emit_ret(buf);
        }
        Body::AddArg0(addend) => {
            emit_mov_rax_slot0(buf);
            emit_add_rax_imm64(buf, addend as u64);
            emit_ret(buf);
        }
        Body::AddArg1(addend) => {
            emit_mov_rax_slot1(buf);
            emit_add_rax_imm64(buf, addend as u64);
            emit_ret(buf);
        }
        Body::Helper(helper) => {
            // Frame setup so the callee sees an aligned stack.
            buf.emit_u8(0x55); // push rbp
            buf.emit_bytes(&[0x48, 0x89, 0xE5]); // mov rbp, rsp
            #[cfg(windows)]
            buf.emit_bytes(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 32 (shadow space)
            emit_mov_rax_imm64(buf, helper.address() as u64);
            buf.emit_bytes(&[0xFF, 0xD0]); // call rax
            #[cfg(windows)]
            buf.emit_bytes(&[0x48, 0x83, 0xC4, 0x20]); // add rsp, 32
            buf.emit_u8(0x5D); // pop rbp
            emit_ret(buf);
        }
    }
}

fn emit_mov_rax_imm64(buf: &mut ExecutableBuffer, value: u64) {
    buf.emit_bytes(&[0x48, 0xB8]); // mov rax, imm64
    buf.emit_u64(value);
}

fn emit_mov_rax_slot0(buf: &mut ExecutableBuffer) {
    #[cfg(windows)]
    buf.emit_bytes(&[0x48, 0x89, 0xC8]); // mov rax, rcx
    #[cfg(not(windows))]
    buf.emit_bytes(&[0x48, 0x89, 0xF8]); // mov rax, rdi
}

fn emit_mov_rax_slot1(buf: &mut ExecutableBuffer) {
    #[cfg(windows)]
    buf.emit_bytes(&[0x48, 0x89, 0xD0]); // mov rax, rdx
    #[cfg(not(windows))]
    buf.emit_bytes(&[0x48, 0x89, 0xF0]); // mov rax, rsi
}

fn emit_add_rax_imm64(buf: &mut ExecutableBuffer, addend: u64) {
    buf.emit_bytes(&[0x49, 0xBA]); // mov r10, imm64
    buf.emit_u64(addend);
    buf.emit_bytes(&[0x4C, 0x01, 0xD0]); // add rax, r10
}

fn emit_ret(buf: &mut ExecutableBuffer) {
    buf.emit_u8(0xC3);
}
