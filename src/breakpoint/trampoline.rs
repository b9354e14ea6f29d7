//! The trampoline every breakpoint goes through
//!
//! One trampoline is assembled per engine, into a cave of its own, with the engine's
//! [`BreakpointTable`] and [`breakpoint_process`] baked in as immediates. The contract between the
//! breakpoint and the trampoline:
//!
//! 1. The site executes `call cave`, so the top of the stack holds `site + 5`.
//! 2. The cave's entry stub jumps to the trampoline without touching the stack or any register.
//! 3. The trampoline pushes the registers so that the stack holds a [`RegisterSnapshot`] with
//!    `retaddr` on top of it. The saved stack pointer is the address of `retaddr`.
//! 4. It saves the x87/SSE state, aligns the stack and calls
//!    `breakpoint_process(table, snapshot)` (cdecl on x86, System V on x86_64).
//! 5. The return value is the number of bytes to move the snapshot down the stack (negative to
//!    move it up). The trampoline moves it, restores every register from it and `ret`s into
//!    `retaddr`, which dispatch set to the relocated instructions on [`Resume::Continue`].
//!
//! On x86_64 System V, the pushes clobber the red zone of a leaf function. Breakpoints must not be
//! placed where the red zone holds live data.
//!
//! [`Resume::Continue`]: super::Resume::Continue

use crate::alloc::CaveAllocator;
use crate::code::{Architecture, Native};

use super::process::{breakpoint_process, BreakpointTable};
use super::regs::RegisterSnapshot;
use super::BreakpointError;

/// Signature of [`breakpoint_process`] on this architecture
#[cfg(target_arch = "x86_64")]
type Process = unsafe extern "sysv64" fn(*const BreakpointTable, *mut RegisterSnapshot) -> isize;
/// Signature of [`breakpoint_process`] on this architecture
#[cfg(target_arch = "x86")]
type Process = unsafe extern "C" fn(*const BreakpointTable, *mut RegisterSnapshot) -> isize;

/// An assembled trampoline
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
    /// Entry point
    address: usize,
}

impl Trampoline {
    /// Assembles the trampoline for `table` into a new cave near `origin`.
    ///
    /// `table` must stay at the same address for as long as any breakpoint may reach the
    /// trampoline.
    pub fn install(
        caves: &mut CaveAllocator,
        origin: usize,
        table: &BreakpointTable,
    ) -> Result<Self, BreakpointError> {
        let table = table as *const BreakpointTable as usize;
        let process = breakpoint_process as Process as usize;

        // The layout only depends on the immediates, not on where the code ends up
        let size = Native::trampoline(0, table, process)?.len();
        let cave = caves.allocate(None, origin, size)?;
        let address = cave.as_ptr() as usize;
        let code = Native::trampoline(address, table, process)?;
        if code.len() > cave.len() {
            return Err(BreakpointError::CaveOverflow {
                needed: code.len(),
                available: cave.len(),
            });
        }
        cave[..code.len()].copy_from_slice(&code);

        log::debug!("Breakpoint trampoline at {address:#x}");
        Ok(Self { address })
    }

    /// Entry point
    pub fn address(&self) -> usize {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install() {
        let mut caves = CaveAllocator::new();
        let table = BreakpointTable::new();
        let origin = test_install as usize;

        let trampoline = Trampoline::install(&mut caves, origin, &table).unwrap();
        assert_eq!(caves.len(), 1);

        let code = unsafe { std::slice::from_raw_parts(trampoline.address() as *const u8, 4) };
        assert_ne!(code, [crate::code::INT3; 4]);
    }
}
