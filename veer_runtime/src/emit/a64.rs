//! AArch64 backend for the template JIT.
//!
//! AAPCS64 on every supported OS: slots arrive in x0 and x1, the result
//! leaves in x0. Constants are materialised with a full movz/movk chain;
//! x9 serves as the scratch register.

use crate::body::Body;
use crate::exec_mem::ExecutableBuffer;

const X0: u32 = 0;
const X9: u32 = 9;

/// Emit a complete body for `extern "C" fn(i64, i64) -> i64`.
pub(crate) fn emit(body: &Body, buf: &mut ExecutableBuffer) {
    match *body {
        Body::ReturnInt(value) => {
            emit_mov_imm(buf, X0, value as u64);
            emit_ret(buf);
        }
        Body::AddArg0(addend) => {
            emit_mov_imm(buf, X9, addend as u64);
            buf.emit_u32(0x8B09_0000); // add x0, x0, x9
            emit_ret(buf);
        }
        Body::AddArg1(addend) => {
            buf.emit_u32(0xAA01_03E0); // mov x0, x1
            emit_mov_imm(buf, X9, addend as u64);
            buf.emit_u32(0x8B09_0000); // add x0, x0, x9
            emit_ret(buf);
        }
        Body::Helper(helper) => {
            buf.emit_u32(0xA9BF_7BFD); // stp x29, x30, [sp, #-16]!
            buf.emit_u32(0x9100_03FD); // mov x29, sp
            emit_mov_imm(buf, X9, helper.address() as u64);
            buf.emit_u32(0xD63F_0120); // blr x9
            buf.emit_u32(0xA8C1_7BFD); // ldp x29, x30, [sp], #16
            emit_ret(buf);
        }
    }
}

/// movz + movk chain loading a full 64-bit immediate.
fn emit_mov_imm(buf: &mut ExecutableBuffer, reg: u32, value: u64) {
    for hw in 0..4u32 {
        let imm16 = ((value >> (hw * 16)) & 0xFFFF) as u32;
        let base = if hw == 0 { 0xD280_0000 } else { 0xF280_0000 };
        buf.emit_u32(base | (hw << 21) | (imm16 << 5) | reg);
    }
}

fn emit_ret(buf: &mut ExecutableBuffer) {
    buf.emit_u32(0xD65F_03C0);
}
