//! x86_64

use std::mem;

use iced_x86::code_asm::{ptr, qword_ptr, registers::*, CodeAssembler};
use iced_x86::{Code, IcedError};

use super::Architecture;

/// Size of the `fxsave64` area
const FXSAVE_LEN: i32 = 512;

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: u64,
}

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u64) -> [u8; mem::size_of::<JmpAbs>()] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

/// x86_64
pub struct X64;

impl X64 {
    /// Machine words in the register snapshot: flags, 16 general purpose registers, return address
    pub const SNAPSHOT_WORDS: usize = 18;
    /// Index of the `rsp` slot in the snapshot
    const RSP_SLOT: i32 = 12;
}

impl Architecture for X64 {
    const BITNESS: u32 = 64;
    const ENTRY_STUB_LEN: usize = mem::size_of::<JmpAbs>();

    fn jmp_rel32() -> Code {
        Code::Jmp_rel32_64
    }

    fn entry_stub(_ip: usize, trampoline: usize) -> Vec<u8> {
        // the trampoline can be anywhere, so don't rely on rel32
        jmp_abs(trampoline as u64).into()
    }

    fn trampoline(ip: usize, table: usize, process: usize) -> Result<Vec<u8>, IcedError> {
        let retaddr_offset = ((Self::SNAPSHOT_WORDS - 1) * 8) as i32;
        let mut a = CodeAssembler::new(Self::BITNESS)?;
        let mut up = a.create_label();
        let mut done = a.create_label();

        // Snapshot: flags, r15..r8, rdi, rsi, rbp, rsp, rbx, rdx, rcx, rax, retaddr
        for reg in [rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi] {
            a.push(reg)?;
        }
        for reg in [r8, r9, r10, r11, r12, r13, r14, r15] {
            a.push(reg)?;
        }
        a.pushfq()?;
        a.cld()?;

        // Like PUSHAD, the saved stack pointer is the one from before the pushes
        a.lea(rax, ptr(rsp + retaddr_offset))?;
        a.mov(qword_ptr(rsp + Self::RSP_SLOT * 8), rax)?;

        // rbx keeps the snapshot pointer, the callee preserves it
        a.mov(rbx, rsp)?;
        a.and(rsp, -16)?;
        a.sub(rsp, FXSAVE_LEN)?;
        a.fxsave64(ptr(rsp))?;

        // sysv64: process(table, snapshot)
        a.mov(rdi, table as u64)?;
        a.mov(rsi, rbx)?;
        a.mov(rax, process as u64)?;
        a.call(rax)?;
        a.fxrstor64(ptr(rsp))?;
        a.mov(rsp, rbx)?;

        // rax: bytes to move the snapshot down by (negative moves it up)
        a.test(rax, rax)?;
        a.jz(done)?;
        a.mov(rcx, Self::SNAPSHOT_WORDS as i64)?;
        a.js(up)?;
        // moving down: claim the stack first, then copy
        a.mov(rsi, rsp)?;
        a.sub(rsp, rax)?;
        a.mov(rdi, rsp)?;
        a.rep().movsq()?;
        a.jmp(done)?;

        a.set_label(&mut up)?;
        a.lea(rsi, ptr(rsp + retaddr_offset))?;
        a.mov(rdi, rsi)?;
        a.sub(rdi, rax)?;
        a.std()?;
        a.rep().movsq()?;
        a.cld()?;
        a.sub(rsp, rax)?;

        a.set_label(&mut done)?;
        a.popfq()?;
        for reg in [r15, r14, r13, r12, r11, r10, r9, r8, rdi, rsi, rbp] {
            a.pop(reg)?;
        }
        // skip the rsp slot without touching the restored flags
        a.lea(rsp, ptr(rsp + 8))?;
        for reg in [rbx, rdx, rcx, rax] {
            a.pop(reg)?;
        }
        a.ret()?;

        a.assemble(ip as u64)
    }
}
