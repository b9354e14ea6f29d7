//! # Code
//!
//! Machine code helpers for the architectures the engine can patch.
//!
//! Everything that depends on the instruction set lives behind [`Architecture`]: how to decode the
//! bytes at a breakpoint site, how to move them into a code cave, and which stubs the breakpoint
//! call lands in. [`Native`] is the implementation for the process we're running in.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, BlockEncoderResult, Code, Decoder, DecoderOptions,
    IcedError, Instruction, InstructionBlock,
};

pub mod x64;
pub mod x86;

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("hackpoints can only patch x86 and x86_64 processes");

/// Architecture of the current process
#[cfg(target_arch = "x86_64")]
pub type Native = x64::X64;
/// Architecture of the current process
#[cfg(target_arch = "x86")]
pub type Native = x86::X86;

/// Length of `call rel32`, the instruction written at every breakpoint
pub const CALL_LEN: usize = 5;
/// Length of `jmp rel32`
pub const JMP_LEN: usize = 5;
/// Opcode of `call rel32`
pub const CALL_REL32: u8 = 0xe8;
/// Opcode of `jmp rel32`
pub const JMP_REL32: u8 = 0xe9;
/// Single byte `nop`, used to pad out overwritten instructions
pub const NOP: u8 = 0x90;
/// Single byte `int3`, used to fill unused cave space
pub const INT3: u8 = 0xcc;

/// Largest number of bytes a relocated branch can grow by when the block encoder has to turn a
/// short branch into a near one (`loop`/`jrcxz` are the worst case)
pub const MAX_BRANCH_GROWTH: usize = 8;

/// Computes the displacement of a relative field.
///
/// `end` is the address of the first byte after the field, which is what x86 relative operands
/// are measured from. The result wraps at the machine word, so on x86 every target is reachable.
pub fn displacement(end: usize, target: usize) -> i64 {
    target.wrapping_sub(end) as isize as i64
}

/// Returns whether `value` can be stored in `width` bytes as a signed integer
pub fn fits_signed(value: i64, width: usize) -> bool {
    match width {
        8 => true,
        1 | 2 | 4 => {
            let bits = width * 8;
            let min = -(1i64 << (bits - 1));
            let max = (1i64 << (bits - 1)) - 1;
            (min..=max).contains(&value)
        }
        _ => false,
    }
}

/// Returns whether `value` can be stored in `width` bytes, either as a signed or an unsigned integer
pub fn fits(value: i64, width: usize) -> bool {
    fits_signed(value, width) || (width < 8 && value >= 0 && (value as u64) < (1u64 << (width * 8)))
}

/// Encodes a 5 byte relative branch (`call`/`jmp` with a 32-bit displacement) at `site`.
///
/// Returns `None` if `target` is further than 2 GiB away from `site`.
pub fn branch_rel32(opcode: u8, site: usize, target: usize) -> Option<[u8; 5]> {
    let disp = displacement(site.wrapping_add(5), target);
    if !fits_signed(disp, 4) {
        return None;
    }
    let mut code = [opcode, 0, 0, 0, 0];
    code[1..].copy_from_slice(&(disp as i32).to_le_bytes());
    Some(code)
}

/// Helper functions for an architecture
pub trait Architecture {
    /// Decoder and encoder bitness
    const BITNESS: u32;
    /// Length of the stub at the start of every breakpoint cave which forwards to the trampoline
    const ENTRY_STUB_LEN: usize;

    /// Gets the maximum instruction length for this architecture
    fn max_instr_len() -> usize {
        15
    }
    /// Creates an instruction decoder from the given slice, as if it was located at `ip`
    fn decoder(data: &[u8], ip: u64) -> Decoder<'_> {
        Decoder::with_ip(Self::BITNESS, data, ip, DecoderOptions::NONE)
    }
    /// Creates an encoder for the given instruction block
    fn encode(block: InstructionBlock<'_>) -> Result<BlockEncoderResult, IcedError> {
        BlockEncoder::encode(Self::BITNESS, block, BlockEncoderOptions::NONE)
    }
    /// Code of a near relative jump for this bitness
    fn jmp_rel32() -> Code;

    /// Expands the provided size to a whole number of instructions.
    ///
    /// Returns the decoded instructions and their combined length, which is always `>= size`, or
    /// `None` if `code` runs out or contains an invalid instruction before `size` is reached.
    fn expand_size(code: &[u8], ip: usize, size: usize) -> Option<(Vec<Instruction>, usize)> {
        let mut decoder = Self::decoder(code, ip as u64);
        let mut instr = Vec::new();
        let mut new_size = 0;
        while new_size < size {
            if !decoder.can_decode() {
                return None;
            }
            let i = decoder.decode();
            if i.is_invalid() {
                return None;
            }
            new_size += i.len();
            instr.push(i);
        }
        Some((instr, new_size))
    }

    /// Upper bound of the size of `instr` once relocated by [`Architecture::copy_instr`]
    fn relocated_size_bound(instr: &[Instruction]) -> usize {
        let len: usize = instr.iter().map(Instruction::len).sum();
        len + instr.len() * MAX_BRANCH_GROWTH + JMP_LEN + MAX_BRANCH_GROWTH
    }

    /// Re-encodes `instr` so they run from `ip`, followed by a jump to `resume`.
    ///
    /// Relative branches and IP-relative memory operands are fixed up against `ip`.
    fn copy_instr(instr: &[Instruction], resume: usize, ip: usize) -> Result<Vec<u8>, IcedError> {
        let mut block = instr.to_vec();
        block.push(Instruction::with_branch(Self::jmp_rel32(), resume as u64)?);
        let result = Self::encode(InstructionBlock::new(&block, ip as u64))?;
        Ok(result.code_buffer)
    }

    /// Generates the stub at `ip` which forwards a breakpoint call to `trampoline` without
    /// touching the stack
    fn entry_stub(ip: usize, trampoline: usize) -> Vec<u8>;

    /// Assembles the trampoline at `ip`.
    ///
    /// `table` is passed through to `process` as its first argument, the register snapshot as
    /// its second. See [`crate::breakpoint::trampoline`] for the contract.
    fn trampoline(ip: usize, table: usize, process: usize) -> Result<Vec<u8>, IcedError>;
}
