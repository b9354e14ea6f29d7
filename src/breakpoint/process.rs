//! Breakpoint dispatch
//!
//! [`breakpoint_process`] is what the trampoline calls. It finds the site from the return address,
//! runs the handlers and tells the trampoline where to resume.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;

use super::handler::Handler;
use super::regs::RegisterSnapshot;
use super::{BreakpointError, Resume};
use crate::code::CALL_LEN;

/// A handler bound to a site, with its configuration entry
#[derive(Clone)]
pub struct BoundHandler {
    /// Configuration key of the handler, for logs
    pub key: String,
    /// The handler
    pub func: Handler,
    /// Entry passed to the handler
    pub info: Value,
}

/// Everything dispatch needs to know about one breakpoint
pub struct Site {
    /// Start of the relocated instructions in the cave
    pub cave: usize,
    /// Handlers in configuration order. Empty once the breakpoint was removed.
    pub handlers: Vec<BoundHandler>,
}

impl Site {
    /// Whether the breakpoint behind the site is still installed
    pub fn is_active(&self) -> bool {
        !self.handlers.is_empty()
    }
}

/// Installed sites by address.
///
/// Written only while breakpoints are installed or removed; every firing just takes the read
/// lock long enough to clone the site. Removed breakpoints keep a site without handlers, so a
/// thread that entered the cave before the bytes were restored still resumes through it.
#[derive(Default)]
pub struct BreakpointTable {
    /// Sites by breakpoint address
    sites: RwLock<HashMap<usize, Arc<Site>>>,
}

impl BreakpointTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a site to `address`. Returns `false` if an active one was already bound.
    pub fn insert(&self, address: usize, site: Site) -> bool {
        let mut sites = self.sites.write().unwrap_or_else(PoisonError::into_inner);
        if sites.get(&address).is_some_and(|site| site.is_active()) {
            return false;
        }
        sites.insert(address, Arc::new(site));
        true
    }

    /// Drops the handlers bound to `address`, keeping its cave for late firings
    pub fn retire(&self, address: usize) -> bool {
        let mut sites = self.sites.write().unwrap_or_else(PoisonError::into_inner);
        let Some(site) = sites.get_mut(&address) else {
            return false;
        };
        *site = Arc::new(Site {
            cave: site.cave,
            handlers: Vec::new(),
        });
        true
    }

    /// Forgets `address` entirely
    pub fn remove(&self, address: usize) -> Option<Arc<Site>> {
        self.sites
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address)
    }

    /// Site bound to `address`
    pub fn get(&self, address: usize) -> Option<Arc<Site>> {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .cloned()
    }

    /// Whether an active site is bound to `address`
    pub fn contains(&self, address: usize) -> bool {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&address)
            .is_some_and(|site| site.is_active())
    }

    /// Number of active sites
    pub fn len(&self) -> usize {
        self.sites
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|site| site.is_active())
            .count()
    }

    /// Whether no active site is bound
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Runs the handlers of the breakpoint that was hit.
///
/// Returns the number of bytes the register block has to move down the stack before the
/// registers are restored, derived from the change handlers made to the saved stack pointer.
pub fn dispatch(table: &BreakpointTable, regs: &mut RegisterSnapshot) -> isize {
    let address = regs.retaddr.wrapping_sub(CALL_LEN);
    let Some(site) = table.get(address) else {
        log::error!("{}", BreakpointError::UnboundAddress { address });
        return 0;
    };

    if !site.is_active() {
        log::debug!("Removed breakpoint at {address:#x} still fired, resuming in its cave");
    }

    let sp = regs.stack_pointer();
    let mut resume = Resume::Continue;
    for handler in &site.handlers {
        log::trace!("Breakpoint {address:#x}: {}", handler.key);
        let result = panic::catch_unwind(AssertUnwindSafe(|| (handler.func)(regs, &handler.info)))
            .unwrap_or_else(|_| {
                log::error!(
                    "Handler {} panicked at breakpoint {address:#x}",
                    handler.key
                );
                Resume::Continue
            });
        // every handler runs, even after a Skip
        resume = resume.and(result);
    }

    if resume == Resume::Continue {
        regs.retaddr = site.cave;
    }
    sp.wrapping_sub(regs.stack_pointer()) as isize
}

/// Entry point called by the x86_64 trampoline
///
/// # Safety
///
/// `table` and `regs` must be valid, `regs` exclusively owned by this call
#[cfg(target_arch = "x86_64")]
pub unsafe extern "sysv64" fn breakpoint_process(
    table: *const BreakpointTable,
    regs: *mut RegisterSnapshot,
) -> isize {
    dispatch(&*table, &mut *regs)
}

/// Entry point called by the x86 trampoline
///
/// # Safety
///
/// `table` and `regs` must be valid, `regs` exclusively owned by this call
#[cfg(target_arch = "x86")]
pub unsafe extern "C" fn breakpoint_process(
    table: *const BreakpointTable,
    regs: *mut RegisterSnapshot,
) -> isize {
    dispatch(&*table, &mut *regs)
}
