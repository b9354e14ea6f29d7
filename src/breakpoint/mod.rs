//! # Breakpoints
//!
//! A breakpoint replaces the instructions at an address with a `call` into a per-breakpoint code
//! cave:
//!
//! ```text
//! site:   call cave           cave:   entry stub ──► trampoline ──► handlers
//!         nop ...                     relocated instructions ◄── Continue
//!                                     jmp site + overwritten_len
//! ```
//!
//! The trampoline captures a [`RegisterSnapshot`], runs every handler bound to the site in
//! configuration order and then either executes the relocated instructions ([`Resume::Continue`])
//! or returns straight to `retaddr` ([`Resume::Skip`]).

use std::convert::Infallible;

use iced_x86::IcedError;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::alloc::CaveError;
use crate::patcher::byte::PatchModified;
use crate::patcher::mem::PermissionError;

pub mod handler;
pub mod install;
pub mod process;
pub mod regs;
pub mod trampoline;

pub use self::handler::{Handler, HandlerDirectory, HandlerError};
pub use self::install::InstalledBreakpoint;
pub use self::process::BreakpointTable;
pub use self::regs::RegisterSnapshot;

/// What happens after the handlers of a breakpoint ran
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resume {
    /// Return to `retaddr` without running the overwritten instructions
    Skip = 0,
    /// Run the overwritten instructions, then carry on after them
    #[default]
    Continue = 1,
}

impl Resume {
    /// The breakpoint's `cave_exec` setting, [`Resume::Continue`] unless it is `false`.
    ///
    /// For handlers that changed some state and leave the rest to the configuration.
    pub fn cave_exec_flag(info: &Value) -> Self {
        match info.get("cave_exec").and_then(Value::as_bool) {
            Some(false) => Resume::Skip,
            _ => Resume::Continue,
        }
    }

    /// Combines the decisions of two handlers: any `Skip` wins
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Resume::Continue, Resume::Continue) => Resume::Continue,
            _ => Resume::Skip,
        }
    }
}

/// Errors while installing or removing breakpoints
#[derive(Debug, Error)]
pub enum BreakpointError {
    /// The instructions at the address couldn't be decoded far enough
    #[error("can't find instruction boundaries at {address:#x}")]
    InstructionScanFailed {
        /// Breakpoint address
        address: usize,
    },
    /// No cave could be allocated for the relocated instructions
    #[error(transparent)]
    CaveAllocationFailed(#[from] CaveError),
    /// The cave ended up out of `call rel32` range
    #[error("code cave at {cave:#x} is out of reach of {address:#x}")]
    CaveOutOfReach {
        /// Breakpoint address
        address: usize,
        /// Cave address
        cave: usize,
    },
    /// A breakpoint is already installed at the address
    #[error("a breakpoint is already installed at {address:#x}")]
    AlreadyBound {
        /// Breakpoint address
        address: usize,
    },
    /// The overwritten bytes would overlap another breakpoint
    #[error("breakpoint at {address:#x} overlaps the one at {other:#x}")]
    Overlapping {
        /// Breakpoint address
        address: usize,
        /// Address of the installed breakpoint
        other: usize,
    },
    /// The overwritten instructions can't be moved into the cave
    #[error("can't relocate instructions: {0}")]
    Relocation(#[from] IcedError),
    /// The relocated instructions outgrew their cave
    #[error("relocated instructions need {needed} bytes, the cave has {available}")]
    CaveOverflow {
        /// Size of the relocated code
        needed: usize,
        /// Room left in the cave
        available: usize,
    },
    /// The site couldn't be made writable
    #[error(transparent)]
    Protection(#[from] PermissionError<Infallible>),
    /// The original bytes couldn't be put back
    #[error(transparent)]
    Restore(#[from] PermissionError<PatchModified>),
    /// A breakpoint fired at an address nothing is bound to
    #[error("breakpoint hit at {address:#x}, but nothing is bound there")]
    UnboundAddress {
        /// Address recovered from the return address
        address: usize,
    },
    /// Every entry at the address was skipped
    #[error("no handlers to bind at {address:#x}")]
    NoHandlers {
        /// Breakpoint address
        address: usize,
    },
}

/// A `breakpoints` entry
#[derive(Debug, Clone)]
pub struct BreakpointDescriptor {
    /// Handler reference, `name` or `name#instance`
    pub handler: String,
    /// Whether the overwritten instructions run after the handlers, by default
    pub cave_exec: bool,
    /// Minimum number of bytes to overwrite
    pub cavesize: Option<usize>,
    /// Skip the entry
    pub ignore: bool,
    /// The whole entry, handed to the handler
    pub info: Value,
}

/// Known fields of a breakpoint entry
#[derive(Deserialize)]
struct DescriptorFields {
    /// Handler reference
    handler: String,
    /// `cave_exec`
    #[serde(default = "default_cave_exec")]
    cave_exec: bool,
    /// `cavesize`
    #[serde(default)]
    cavesize: Option<usize>,
    /// `ignore`
    #[serde(default)]
    ignore: bool,
}

/// `cave_exec` defaults to true
fn default_cave_exec() -> bool {
    true
}

impl BreakpointDescriptor {
    /// Parses an entry object. Fields the engine doesn't know are kept for the handler.
    pub fn from_value(info: &Value) -> Result<Self, serde_json::Error> {
        let fields = DescriptorFields::deserialize(info)?;
        Ok(Self {
            handler: fields.handler,
            cave_exec: fields.cave_exec,
            cavesize: fields.cavesize,
            ignore: fields.ignore,
            info: info.clone(),
        })
    }
}
