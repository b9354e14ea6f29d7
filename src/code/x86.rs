//! 32-bit x86 (`PUSHAD` register layout)

use iced_x86::code_asm::{ptr, registers::*, CodeAssembler};
use iced_x86::{Code, IcedError};

use super::{Architecture, JMP_REL32};

/// Size of the `fxsave` area
const FXSAVE_LEN: i32 = 512;

/// 32-bit x86
pub struct X86;

impl X86 {
    /// Machine words in the register snapshot: flags, 8 `PUSHAD` registers, return address
    pub const SNAPSHOT_WORDS: usize = 10;
}

impl Architecture for X86 {
    const BITNESS: u32 = 32;
    const ENTRY_STUB_LEN: usize = 5;

    fn jmp_rel32() -> Code {
        Code::Jmp_rel32_32
    }

    fn entry_stub(ip: usize, trampoline: usize) -> Vec<u8> {
        // rel32 wraps around the 4 GiB address space, so every target is reachable
        let disp = (trampoline as u32).wrapping_sub((ip as u32).wrapping_add(5));
        let mut code = vec![JMP_REL32];
        code.extend_from_slice(&disp.to_le_bytes());
        code
    }

    fn trampoline(ip: usize, table: usize, process: usize) -> Result<Vec<u8>, IcedError> {
        let snapshot_len = (Self::SNAPSHOT_WORDS * 4) as i32;
        let mut a = CodeAssembler::new(Self::BITNESS)?;
        let mut up = a.create_label();
        let mut done = a.create_label();

        // Snapshot: flags, edi, esi, ebp, esp, ebx, edx, ecx, eax, retaddr
        a.pushad()?;
        a.pushfd()?;
        a.cld()?;

        // ebx keeps the snapshot pointer, the callee preserves it
        a.mov(ebx, esp)?;
        a.and(esp, -16)?;
        a.sub(esp, FXSAVE_LEN)?;
        a.fxsave(ptr(esp))?;

        // cdecl: process(table, snapshot), stack 16-byte aligned at the call
        a.sub(esp, 8)?;
        a.push(ebx)?;
        a.mov(eax, table as u32)?;
        a.push(eax)?;
        a.mov(eax, process as u32)?;
        a.call(eax)?;
        a.add(esp, 16)?;
        a.fxrstor(ptr(esp))?;
        a.mov(esp, ebx)?;

        // eax: bytes to move the snapshot down by (negative moves it up)
        a.test(eax, eax)?;
        a.jz(done)?;
        a.mov(ecx, Self::SNAPSHOT_WORDS as u32)?;
        a.js(up)?;
        // moving down: claim the stack first, then copy
        a.mov(esi, esp)?;
        a.sub(esp, eax)?;
        a.mov(edi, esp)?;
        a.rep().movsd()?;
        a.jmp(done)?;

        a.set_label(&mut up)?;
        a.lea(esi, ptr(esp + (snapshot_len - 4)))?;
        a.mov(edi, esi)?;
        a.sub(edi, eax)?;
        a.std()?;
        a.rep().movsd()?;
        a.cld()?;
        a.sub(esp, eax)?;

        a.set_label(&mut done)?;
        a.popfd()?;
        a.popad()?;
        a.ret()?;

        a.assemble(ip as u64)
    }
}

#[cfg(test)]
mod tests {
    use iced_x86::{Decoder, DecoderOptions, Mnemonic};

    use super::*;

    #[test]
    fn test_entry_stub() {
        let stub = X86::entry_stub(0x1000, 0x2000);
        assert_eq!(stub.len(), X86::ENTRY_STUB_LEN);
        assert_eq!(hex::encode(stub), "e9fb0f0000");
    }

    #[test]
    /// Wrapping jumps are valid in 32-bit code
    fn test_entry_stub_wraps() {
        let stub = X86::entry_stub(0xffff_f000, 0x1000);
        let mut decoder = Decoder::with_ip(32, &stub, 0xffff_f000, DecoderOptions::NONE);
        assert_eq!(decoder.decode().near_branch_target(), 0x1000);
    }

    #[test]
    /// The register save and restore have to match the snapshot layout exactly
    fn test_trampoline_layout() {
        let code = X86::trampoline(0x10000, 0x1234_5678, 0x0abc_def0).unwrap();
        let instr: Vec<_> = Decoder::with_ip(32, &code, 0x10000, DecoderOptions::NONE)
            .into_iter()
            .collect();
        assert!(instr.iter().all(|i| !i.is_invalid()));

        let mnemonics: Vec<_> = instr.iter().map(|i| i.mnemonic()).collect();
        assert_eq!(&mnemonics[..3], &[Mnemonic::Pushad, Mnemonic::Pushfd, Mnemonic::Cld]);
        assert_eq!(
            &mnemonics[mnemonics.len() - 3..],
            &[Mnemonic::Popfd, Mnemonic::Popad, Mnemonic::Ret]
        );

        // both addresses are embedded as immediates
        let immediates: Vec<_> = instr
            .iter()
            .filter(|i| i.mnemonic() == Mnemonic::Mov && i.op_count() == 2)
            .filter_map(|i| i.try_immediate(1).ok())
            .collect();
        assert!(immediates.contains(&0x1234_5678));
        assert!(immediates.contains(&0x0abc_def0));
    }
}
