//! Register state captured when a breakpoint fires

use std::collections::HashMap;
use std::mem;

use lazy_static::lazy_static;
use serde_json::Value;

use crate::code::Native;
use crate::hack::expr::{parse_literal, Resolver};

/// Registers of the interrupted thread, laid out exactly as the trampoline pushes them.
///
/// `esp` is the stack pointer from before the trampoline saved anything, which is the address of
/// `retaddr`. Changing it moves the stack the patched code resumes on: the resumed code sees
/// `esp + 4`, the same as when nothing was changed.
#[cfg(target_arch = "x86")]
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RegisterSnapshot {
    pub flags: usize,
    pub edi: usize,
    pub esi: usize,
    pub ebp: usize,
    pub esp: usize,
    pub ebx: usize,
    pub edx: usize,
    pub ecx: usize,
    pub eax: usize,
    /// Where execution continues after the breakpoint
    pub retaddr: usize,
}

/// Registers of the interrupted thread, laid out exactly as the trampoline pushes them.
///
/// `rsp` is the stack pointer from before the trampoline saved anything, which is the address of
/// `retaddr`. Changing it moves the stack the patched code resumes on: the resumed code sees
/// `rsp + 8`, the same as when nothing was changed.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RegisterSnapshot {
    pub flags: usize,
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub r11: usize,
    pub r10: usize,
    pub r9: usize,
    pub r8: usize,
    pub rdi: usize,
    pub rsi: usize,
    pub rbp: usize,
    pub rsp: usize,
    pub rbx: usize,
    pub rdx: usize,
    pub rcx: usize,
    pub rax: usize,
    /// Where execution continues after the breakpoint
    pub retaddr: usize,
}

/// Number of machine words in a [`RegisterSnapshot`]
pub const SNAPSHOT_WORDS: usize = Native::SNAPSHOT_WORDS;

const _: () = assert!(mem::size_of::<RegisterSnapshot>() == SNAPSHOT_WORDS * mem::size_of::<usize>());

/// Field names in snapshot order
#[cfg(target_arch = "x86")]
const REGISTER_NAMES: [&str; SNAPSHOT_WORDS] = [
    "flags", "edi", "esi", "ebp", "esp", "ebx", "edx", "ecx", "eax", "retaddr",
];
/// Field names in snapshot order
#[cfg(target_arch = "x86_64")]
const REGISTER_NAMES: [&str; SNAPSHOT_WORDS] = [
    "flags", "r15", "r14", "r13", "r12", "r11", "r10", "r9", "r8", "rdi", "rsi", "rbp", "rsp",
    "rbx", "rdx", "rcx", "rax", "retaddr",
];

/// Index of the stack pointer
#[cfg(target_arch = "x86")]
const SP_SLOT: usize = 4;
/// Index of the stack pointer
#[cfg(target_arch = "x86_64")]
const SP_SLOT: usize = 12;

lazy_static! {
    /// Lowercase register name to snapshot index
    static ref REGISTERS: HashMap<&'static str, usize> = {
        let mut map: HashMap<_, _> = REGISTER_NAMES
            .iter()
            .enumerate()
            .map(|(index, name)| (*name, index))
            .collect();
        map.insert("eflags", 0);
        map.insert("rflags", 0);
        map
    };
}

impl RegisterSnapshot {
    /// The snapshot as an array of words
    fn words(&self) -> &[usize; SNAPSHOT_WORDS] {
        // Safety: repr(C) struct made of exactly SNAPSHOT_WORDS usizes
        unsafe { &*(self as *const Self).cast() }
    }

    /// The snapshot as a mutable array of words
    fn words_mut(&mut self) -> &mut [usize; SNAPSHOT_WORDS] {
        // Safety: see `words`
        unsafe { &mut *(self as *mut Self).cast() }
    }

    /// Looks up a register by name, ignoring case.
    ///
    /// Writing through the returned reference changes the register the patched code resumes with.
    pub fn register(&mut self, name: &str) -> Option<&mut usize> {
        let index = *REGISTERS.get(name.trim().to_ascii_lowercase().as_str())?;
        Some(&mut self.words_mut()[index])
    }

    /// Value of a register, by name
    pub fn get(&self, name: &str) -> Option<usize> {
        let index = *REGISTERS.get(name.trim().to_ascii_lowercase().as_str())?;
        Some(self.words()[index])
    }

    /// The register named by the string at `info[key]`, for handlers taking a register as a
    /// parameter
    pub fn register_from(&mut self, info: &Value, key: &str) -> Option<&mut usize> {
        let name = info.get(key)?.as_str()?;
        self.register(name)
    }

    /// Evaluates a parameter of a handler.
    ///
    /// Strings are expressions over the registers (`"eax"`, `"esp+4"`, `"0x10"`), numbers are
    /// taken as is.
    pub fn value_of(&self, value: &Value) -> Option<usize> {
        match value {
            Value::String(expr) => Resolver::new(&()).with_registers(self).resolve(expr).ok(),
            Value::Number(number) => number
                .as_u64()
                .map(|n| n as usize)
                .or_else(|| number.as_i64().map(|n| n as usize)),
            _ => None,
        }
    }

    /// Numeric handler parameter at `info[key]`, given either as a number or a literal string
    pub fn param(info: &Value, key: &str) -> Option<usize> {
        match info.get(key)? {
            Value::String(s) => parse_literal(s.trim())?.ok(),
            Value::Number(number) => number.as_u64().map(|n| n as usize),
            _ => None,
        }
    }

    /// Saved stack pointer
    pub fn stack_pointer(&self) -> usize {
        self.words()[SP_SLOT]
    }

    /// Mutable saved stack pointer
    pub fn stack_pointer_mut(&mut self) -> &mut usize {
        &mut self.words_mut()[SP_SLOT]
    }
}
