//! Writing breakpoints into code and taking them out again

use std::ops::Range;

use iced_x86::Instruction;

use super::process::{BoundHandler, BreakpointTable, Site};
use super::BreakpointError;
use crate::alloc::CaveAllocator;
use crate::code::{self, Architecture, Native, CALL_LEN, CALL_REL32, NOP};
use crate::patcher::{PatchGuard, Patcher, TargetMemory, TargetPatch};

/// Instructions a breakpoint will overwrite
pub struct Scan {
    /// Decoded instructions
    instr: Vec<Instruction>,
    /// Their combined length
    len: usize,
}

impl Scan {
    /// Decodes whole instructions at `address` until at least `min_len` bytes (and never fewer than
    /// a `call`) are covered, looking at most `scan_limit` bytes ahead
    ///
    /// # Safety
    ///
    /// `address` must point into mapped code
    pub unsafe fn new(
        address: usize,
        min_len: usize,
        scan_limit: usize,
    ) -> Result<Self, BreakpointError> {
        let failed = || BreakpointError::InstructionScanFailed { address };

        // Don't read past the end of the mapping
        let mapped = region::query(address as *const u8).map_err(|_| failed())?;
        let available = mapped.as_range().end.saturating_sub(address);
        // the limit never cuts off the last instruction of the requested length
        let limit = scan_limit.max(min_len + Native::max_instr_len());
        let code = TargetMemory::default().read(address as *const u8, limit.min(available));

        let (instr, len) =
            Native::expand_size(&code, address, min_len.max(CALL_LEN)).ok_or_else(failed)?;
        Ok(Self { instr, len })
    }

    /// Number of bytes that will be overwritten
    pub fn len(&self) -> usize {
        self.len
    }
}

/// A breakpoint written into code
pub struct InstalledBreakpoint {
    /// Start of the relocated instructions
    cave: usize,
    /// The `call` and its padding
    patch: TargetPatch,
}

impl InstalledBreakpoint {
    /// Installs a breakpoint at `address`.
    ///
    /// The site stays untouched unless every step succeeds.
    ///
    /// # Safety
    ///
    /// `address` must be the start of an instruction, and no thread may be executing the scanned
    /// instructions while they are overwritten. `trampoline` must be the trampoline of `table`.
    pub unsafe fn install(
        address: usize,
        scan: Scan,
        handlers: Vec<BoundHandler>,
        caves: &mut CaveAllocator,
        table: &BreakpointTable,
        trampoline: usize,
        memory: &TargetMemory,
    ) -> Result<Self, BreakpointError> {
        if handlers.is_empty() {
            return Err(BreakpointError::NoHandlers { address });
        }
        if table.contains(address) {
            return Err(BreakpointError::AlreadyBound { address });
        }

        // cave: entry stub, relocated instructions, jmp back
        let bound = Native::relocated_size_bound(&scan.instr);
        let cave = caves.allocate(None, address, Native::ENTRY_STUB_LEN + bound)?;
        let cave_address = cave.as_ptr() as usize;
        let code_address = cave_address + Native::ENTRY_STUB_LEN;

        let relocated = Native::copy_instr(&scan.instr, address + scan.len, code_address)?;
        if relocated.len() > bound {
            return Err(BreakpointError::CaveOverflow {
                needed: relocated.len(),
                available: bound,
            });
        }
        let stub = Native::entry_stub(cave_address, trampoline);
        cave[..stub.len()].copy_from_slice(&stub);
        cave[stub.len()..stub.len() + relocated.len()].copy_from_slice(&relocated);

        let call = code::branch_rel32(CALL_REL32, address, cave_address).ok_or(
            BreakpointError::CaveOutOfReach {
                address,
                cave: cave_address,
            },
        )?;
        let mut site = vec![NOP; scan.len];
        site[..CALL_LEN].copy_from_slice(&call);

        // Bind first, the site can fire as soon as it's written
        let site_bound = table.insert(
            address,
            Site {
                cave: code_address,
                handlers,
            },
        );
        if !site_bound {
            return Err(BreakpointError::AlreadyBound { address });
        }
        let patch = match memory.patch(address as *mut u8, &site) {
            Ok(patch) => patch,
            Err(e) => {
                table.remove(address);
                return Err(e.into());
            }
        };

        Ok(Self {
            cave: code_address,
            patch,
        })
    }

    /// Breakpoint address
    pub fn address(&self) -> usize {
        self.patch.location()
    }

    /// Address of the relocated instructions
    pub fn cave(&self) -> usize {
        self.cave
    }

    /// Number of bytes overwritten at the address
    pub fn overwritten_len(&self) -> usize {
        self.patch.len()
    }

    /// The overwritten bytes
    pub fn original(&self) -> &[u8] {
        self.patch.original()
    }

    /// Addresses covered by the breakpoint
    pub fn range(&self) -> Range<usize> {
        self.address()..self.address() + self.overwritten_len()
    }

    /// Puts the original bytes back.
    ///
    /// Fails, leaving memory alone, if the site no longer holds what was written there.
    pub fn remove(self) -> Result<(), BreakpointError> {
        self.patch.restore()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::alloc::CaveError;
    use crate::breakpoint::{RegisterSnapshot, Resume};

    fn bp_none(_regs: &mut RegisterSnapshot, _info: &serde_json::Value) -> Resume {
        Resume::Continue
    }

    fn handlers() -> Vec<BoundHandler> {
        vec![BoundHandler {
            key: "none".to_owned(),
            func: bp_none,
            info: json!({}),
        }]
    }

    /// push rbp/ebp; mov rbp, rsp; sub rsp, 0x10 on x86_64, the same with 32-bit registers on x86
    #[cfg(target_arch = "x86_64")]
    const PROLOGUE: &str = "554889e54883ec10c3";
    #[cfg(target_arch = "x86")]
    const PROLOGUE: &str = "5589e583ec10c3";
    /// Whole instructions covering a `call`: everything but the `ret`
    const OVERWRITTEN: usize = PROLOGUE.len() / 2 - 1;

    #[test]
    /// Never executed, the buffer only has to look like code
    fn test_install_remove() {
        let mut buf = hex::decode(PROLOGUE).unwrap();
        let address = buf.as_mut_ptr() as usize;
        let before = buf.clone();

        let mut caves = CaveAllocator::new();
        let table = BreakpointTable::new();
        let memory = TargetMemory::default();

        let scan = unsafe { Scan::new(address, 0, 64) }.unwrap();
        assert_eq!(scan.len(), OVERWRITTEN);
        let bp = unsafe {
            InstalledBreakpoint::install(address, scan, handlers(), &mut caves, &table, 0x1000, &memory)
        }
        .unwrap();

        // call cave + nops, up to a whole instruction
        let site = unsafe { std::slice::from_raw_parts(address as *const u8, before.len()) };
        assert_eq!(site[0], CALL_REL32);
        let disp = i32::from_le_bytes(site[1..5].try_into().unwrap());
        let cave = (address + CALL_LEN).wrapping_add(disp as isize as usize);
        assert_eq!(cave + Native::ENTRY_STUB_LEN, bp.cave());
        assert!(site[CALL_LEN..bp.overwritten_len()].iter().all(|&b| b == NOP));
        assert_eq!(*site.last().unwrap(), 0xc3);
        assert_eq!(bp.original(), &before[..bp.overwritten_len()]);
        assert!(table.contains(address));

        // relocated instructions end with a jump back behind the overwritten ones
        let cave_code = unsafe { std::slice::from_raw_parts(bp.cave() as *const u8, 32) };
        let instr: Vec<_> = Native::decoder(cave_code, bp.cave() as u64)
            .into_iter()
            .take_while(|i| !i.is_invalid())
            .collect();
        let jmp = instr
            .iter()
            .find(|i| i.mnemonic() == iced_x86::Mnemonic::Jmp)
            .unwrap();
        assert_eq!(jmp.near_branch_target() as usize, address + bp.overwritten_len());

        bp.remove().unwrap();
        assert_eq!(buf, before);
    }

    #[test]
    fn test_already_bound() {
        let mut buf = hex::decode(PROLOGUE).unwrap();
        let address = buf.as_mut_ptr() as usize;

        let mut caves = CaveAllocator::new();
        let table = BreakpointTable::new();
        let memory = TargetMemory::default();
        table.insert(
            address,
            Site {
                cave: 0,
                handlers: handlers(),
            },
        );

        let scan = unsafe { Scan::new(address, 0, 64) }.unwrap();
        let before = buf.clone();
        let err = unsafe {
            InstalledBreakpoint::install(address, scan, handlers(), &mut caves, &table, 0x1000, &memory)
        }
        .err()
        .unwrap();
        assert!(matches!(err, BreakpointError::AlreadyBound { .. }));
        assert_eq!(buf, before);
    }

    #[test]
    /// A cave that can't be allocated leaves both the code and the table alone
    fn test_cave_allocation_failed() {
        let mut buf = hex::decode(PROLOGUE).unwrap();
        let address = buf.as_mut_ptr() as usize;
        let before = buf.clone();

        let mut caves = CaveAllocator::with_range(0);
        let table = BreakpointTable::new();
        let memory = TargetMemory::default();

        let scan = unsafe { Scan::new(address, 0, 64) }.unwrap();
        let err = unsafe {
            InstalledBreakpoint::install(address, scan, handlers(), &mut caves, &table, 0x1000, &memory)
        }
        .err()
        .unwrap();
        assert!(matches!(
            err,
            BreakpointError::CaveAllocationFailed(CaveError::CaveAllocationFailed { .. })
        ));
        assert_eq!(buf, before);
        assert!(!table.contains(address));
        assert!(table.get(address).is_none());
    }

    #[test]
    /// `cavesize` widens the overwrite, still to whole instructions
    fn test_min_len() {
        let mut buf = hex::decode(PROLOGUE).unwrap();
        let address = buf.as_mut_ptr() as usize;
        let scan = unsafe { Scan::new(address, CALL_LEN + 1, 64) }.unwrap();
        assert_eq!(scan.len(), OVERWRITTEN);
        let scan = unsafe { Scan::new(address, OVERWRITTEN + 1, 64) }.unwrap();
        assert_eq!(scan.len(), OVERWRITTEN + 1);
    }

    #[test]
    fn test_scan_failed() {
        // ff /7 is undefined
        let mut buf = vec![0x90u8, 0x90, 0xff, 0xff];
        let address = buf.as_mut_ptr() as usize;
        let err = unsafe { Scan::new(address, 0, buf.len()) }.err().unwrap();
        assert!(matches!(err, BreakpointError::InstructionScanFailed { address: a } if a == address));
    }
}
