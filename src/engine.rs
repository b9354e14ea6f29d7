//! # Engine
//!
//! Applies a patch configuration to the running process:
//!
//! ```json
//! {
//!     "codecaves": { "skip": "b8 01000000 c3" },
//!     "binhacks": { "Rx1234": { "title": "no intro", "code": "e8 [codecave:skip]", "expected": "e8 [Rx9000]" } },
//!     "breakpoints": { "Rx5678": [{ "handler": "file_load", "str": "eax" }] }
//! }
//! ```
//!
//! Every entry is applied on its own: one that fails is logged and skipped, and the `apply_*`
//! functions report whether everything went through.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::mem::ManuallyDrop;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::alloc::{CaveAllocator, CaveError};
use crate::breakpoint::install::{InstalledBreakpoint, Scan};
use crate::breakpoint::process::{BoundHandler, BreakpointTable};
use crate::breakpoint::trampoline::Trampoline;
use crate::breakpoint::{BreakpointDescriptor, BreakpointError, HandlerDirectory, HandlerError};
use crate::hack::expr::{ExprError, Resolver};
use crate::hack::{BinaryHack, CodeCave, Hack, HackError};
use crate::patcher::mem::PermissionError;
use crate::patcher::{PatchGuard, Patcher, TargetMemory};

/// Errors of a single configuration entry
#[derive(Debug, Error)]
pub enum EngineError {
    /// The address key doesn't resolve
    #[error("invalid address `{expr}`: {source}")]
    InvalidAddress {
        /// Address expression
        expr: String,
        /// Why it failed
        #[source]
        source: ExprError,
    },
    /// The entry isn't shaped as expected
    #[error("invalid entry: {0}")]
    InvalidEntry(#[from] serde_json::Error),
    /// A section isn't an object
    #[error("`{0}` must be an object")]
    InvalidSection(&'static str),
    /// See [`HackError`]
    #[error(transparent)]
    Hack(#[from] HackError),
    /// See [`CaveError`]
    #[error(transparent)]
    Cave(#[from] CaveError),
    /// See [`BreakpointError`]
    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),
    /// See [`HandlerError`]
    #[error(transparent)]
    Handler(#[from] HandlerError),
    /// The bytes at the address aren't what the hack expects
    #[error("unexpected bytes at {address:#x}: expected {expected:02x?}, found {found:02x?}")]
    ExpectedMismatch {
        /// Hack address
        address: usize,
        /// Rendered `expected` hack
        expected: Vec<u8>,
        /// Bytes in memory
        found: Vec<u8>,
    },
    /// The address couldn't be made writable
    #[error(transparent)]
    Protection(#[from] PermissionError<Infallible>),
}

/// Engine settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Image base of the patched module. `Rx` offsets are relative to it and named caves are
    /// placed close to it.
    pub module_base: usize,
    /// How many bytes to decode at most when looking for instruction boundaries
    pub scan_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            module_base: 0,
            scan_limit: 64,
        }
    }
}

/// Counts the instances in a `binhacks` or `breakpoints` section.
///
/// An address holding a list counts each element, anything else counts once.
pub fn count(section: &Value) -> usize {
    section.as_object().map_or(0, |entries| {
        entries
            .values()
            .map(|entry| entry.as_array().map_or(1, Vec::len))
            .sum()
    })
}

/// The entries at one address
fn instances(value: &Value) -> &[Value] {
    match value {
        Value::Array(entries) => entries,
        single => std::slice::from_ref(single),
    }
}

/// A section as an object. A missing section is empty.
fn section<'a>(
    section: &'a Value,
    name: &'static str,
) -> Result<Option<&'a Map<String, Value>>, EngineError> {
    match section {
        Value::Null => Ok(None),
        Value::Object(entries) => Ok(Some(entries)),
        _ => Err(EngineError::InvalidSection(name)),
    }
}

/// Binary hacks and breakpoints applied to the running process.
///
/// Breakpoints stay installed until [`Engine::remove_all`] or until the engine is dropped. Binary
/// hacks and code caves are permanent.
pub struct Engine {
    /// Settings
    options: EngineOptions,
    /// Handlers breakpoints can bind
    handlers: HandlerDirectory,
    /// Writes into the process
    memory: TargetMemory,
    /// Installed breakpoints by address
    installed: BTreeMap<usize, InstalledBreakpoint>,
    /// Breakpoint trampoline, assembled with the first breakpoint
    trampoline: Option<Trampoline>,
    /// Whether anything may still jump into the caves after the engine is gone
    caves_in_use: bool,
    /// Sites the trampoline dispatches. Boxed since the trampoline embeds its address.
    table: ManuallyDrop<Box<BreakpointTable>>,
    /// Every cave of the engine
    caves: ManuallyDrop<CaveAllocator>,
}

impl Engine {
    /// Creates an engine which hasn't touched the process yet
    pub fn new(options: EngineOptions, handlers: HandlerDirectory) -> Self {
        Self {
            options,
            handlers,
            memory: TargetMemory::default(),
            installed: BTreeMap::new(),
            trampoline: None,
            caves_in_use: false,
            table: ManuallyDrop::new(Box::default()),
            caves: ManuallyDrop::new(CaveAllocator::new()),
        }
    }

    /// Settings of the engine
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Counts the instances in a section, see [`count`]
    pub fn count(&self, section: &Value) -> usize {
        count(section)
    }

    /// Resolver over the caves allocated so far
    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&*self.caves).with_module_base(self.options.module_base)
    }

    /// Resolves an address key
    fn address(&self, expr: &str) -> Result<usize, EngineError> {
        self.resolver()
            .resolve(expr)
            .map_err(|source| EngineError::InvalidAddress {
                expr: expr.to_owned(),
                source,
            })
    }

    /// Warns that `section` is placed around this crate's code rather than the patched module
    fn check_module_base(&self, section: &str) {
        if cfg!(target_arch = "x86_64") && self.options.module_base == 0 {
            log::warn!(
                "Applying {section} without a module_base, code caves may be out of rel32 reach"
            );
        }
    }

    /// Where named caves are allocated around
    fn cave_origin(&self) -> usize {
        match self.options.module_base {
            0 => Self::new as usize,
            base => base,
        }
    }

    /// Address of the cave named `name`
    pub fn cave(&self, name: &str) -> Option<usize> {
        self.caves.address(name)
    }

    /// Whether a breakpoint is installed at `address`
    pub fn is_installed(&self, address: usize) -> bool {
        self.installed.contains_key(&address)
    }

    /// The breakpoint installed at `address`
    pub fn breakpoint(&self, address: usize) -> Option<&InstalledBreakpoint> {
        self.installed.get(&address)
    }

    /// Applies every section of a run configuration: `codecaves`, then `binhacks`, then
    /// `breakpoints`
    pub fn apply(&mut self, config: &Value) -> bool {
        let caves = self.apply_codecaves(&config["codecaves"]);
        let hacks = self.apply_hacks(&config["binhacks"]);
        let breakpoints = self.apply_breakpoints(&config["breakpoints"]);
        caves && hacks && breakpoints
    }

    /// Allocates and renders the `codecaves` section.
    ///
    /// All caves are allocated before any is rendered, so caves can refer to each other.
    pub fn apply_codecaves(&mut self, section: &Value) -> bool {
        let entries = match self::section(section, "codecaves") {
            Ok(Some(entries)) => entries,
            Ok(None) => return true,
            Err(e) => {
                log::error!("{e}");
                return false;
            }
        };

        self.check_module_base("codecaves");
        let mut ok = true;
        let mut allocated = Vec::new();
        for (name, entry) in entries {
            match self.allocate_codecave(name, entry) {
                Ok(hack) => allocated.push((name, hack)),
                Err(e) => {
                    log::error!("Code cave {name}: {e}");
                    ok = false;
                }
            }
        }

        for (name, hack) in allocated {
            match self.render_codecave(name, &hack) {
                Ok(address) => log::info!("Code cave {name} at {address:#x}"),
                Err(e) => {
                    log::error!("Code cave {name}: {e}");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Sizes and allocates one cave
    fn allocate_codecave(&mut self, name: &str, entry: &Value) -> Result<Hack, EngineError> {
        let cave = CodeCave::deserialize(entry)?;
        let hack: Hack = cave.code.parse()?;
        let size = hack.size().max(cave.size.unwrap_or(0));
        let origin = self.cave_origin();
        self.caves.allocate(Some(name), origin, size)?;
        Ok(hack)
    }

    /// Renders one allocated cave
    fn render_codecave(&mut self, name: &str, hack: &Hack) -> Result<usize, EngineError> {
        let Some(address) = self.caves.address(name) else {
            return Err(HackError::UnresolvedReference {
                token: name.to_owned(),
                source: ExprError::UnknownToken(name.to_owned()),
            }
            .into());
        };
        let code = hack.render_to_vec(address, &self.resolver())?;
        if let Some(cave) = self.caves.get_mut(name) {
            cave[..code.len()].copy_from_slice(&code);
        }
        self.caves_in_use = true;
        Ok(address)
    }

    /// Writes the `binhacks` section. Binary hacks can't be undone.
    pub fn apply_hacks(&mut self, section: &Value) -> bool {
        let entries = match self::section(section, "binhacks") {
            Ok(Some(entries)) => entries,
            Ok(None) => return true,
            Err(e) => {
                log::error!("{e}");
                return false;
            }
        };

        self.check_module_base("binhacks");
        let mut ok = true;
        for (key, value) in entries {
            let address = match self.address(key) {
                Ok(address) => address,
                Err(e) => {
                    log::error!("Binary hack {key}: {e}");
                    ok = false;
                    continue;
                }
            };
            for entry in instances(value) {
                let hack = match BinaryHack::deserialize(entry) {
                    Ok(hack) => hack,
                    Err(e) => {
                        log::error!("Binary hack {key}: {e}");
                        ok = false;
                        continue;
                    }
                };
                let title = hack.title.as_deref().unwrap_or(key);
                if hack.ignore {
                    log::warn!("Binary hack {title} ignored");
                    continue;
                }
                // Safety: configuration addresses point into the patched module
                match unsafe { self.apply_hack(address, &hack) } {
                    Ok(len) => log::info!("Binary hack {title}: {len} bytes at {address:#x}"),
                    Err(e) => {
                        log::error!("Binary hack {title}: {e}");
                        ok = false;
                    }
                }
            }
        }
        ok
    }

    /// Renders and writes one hack, returning its size
    ///
    /// # Safety
    ///
    /// `address` must be valid for the size of the hack
    unsafe fn apply_hack(&mut self, address: usize, hack: &BinaryHack) -> Result<usize, EngineError> {
        let code = hack
            .code
            .parse::<Hack>()?
            .render_to_vec(address, &self.resolver())?;

        if let Some(expected) = &hack.expected {
            let expected = expected
                .parse::<Hack>()?
                .render_to_vec(address, &self.resolver())?;
            let found = self.memory.read(address as *const u8, expected.len());
            if found != expected {
                return Err(EngineError::ExpectedMismatch {
                    address,
                    expected,
                    found,
                });
            }
        }

        self.memory.patch(address as *mut u8, &code)?.commit();
        self.caves_in_use = true;
        Ok(code.len())
    }

    /// Installs the `breakpoints` section.
    ///
    /// Entries resolving to the same address share one breakpoint, their handlers running in
    /// configuration order.
    pub fn apply_breakpoints(&mut self, section: &Value) -> bool {
        let entries = match self::section(section, "breakpoints") {
            Ok(Some(entries)) => entries,
            Ok(None) => return true,
            Err(e) => {
                log::error!("{e}");
                return false;
            }
        };

        let mut ok = true;
        // address, handlers, minimum overwrite
        let mut sites: Vec<(usize, Vec<BoundHandler>, usize)> = Vec::new();
        for (key, value) in entries {
            let address = match self.address(key) {
                Ok(address) => address,
                Err(e) => {
                    log::error!("Breakpoint {key}: {e}");
                    ok = false;
                    continue;
                }
            };
            for entry in instances(value) {
                let (handler, cavesize) = match self.bind(entry) {
                    Ok(Some(bound)) => bound,
                    Ok(None) => continue,
                    Err(e) => {
                        log::error!("Breakpoint {key}: {e}");
                        ok = false;
                        continue;
                    }
                };
                match sites.iter_mut().find(|(a, _, _)| *a == address) {
                    Some((_, handlers, min_len)) => {
                        handlers.push(handler);
                        *min_len = (*min_len).max(cavesize);
                    }
                    None => sites.push((address, vec![handler], cavesize)),
                }
            }
        }

        for (address, handlers, min_len) in sites {
            let keys: Vec<_> = handlers.iter().map(|h| h.key.clone()).collect();
            // Safety: configuration addresses point to instructions of the patched module
            match unsafe { self.install(address, handlers, min_len) } {
                Ok(len) => log::info!(
                    "Breakpoint at {address:#x} ({len} bytes): {}",
                    keys.join(", ")
                ),
                Err(e) => {
                    log::error!("Breakpoint at {address:#x}: {e}");
                    ok = false;
                }
            }
        }
        ok
    }

    /// Resolves the handler of one entry, along with its `cavesize`. `None` if the entry is
    /// ignored.
    fn bind(&self, entry: &Value) -> Result<Option<(BoundHandler, usize)>, EngineError> {
        let bp = BreakpointDescriptor::from_value(entry)?;
        if bp.ignore {
            log::warn!("Breakpoint handler {} ignored", bp.handler);
            return Ok(None);
        }
        let func = self.handlers.lookup(&bp.handler)?;
        log::debug!("Binding {} (cave_exec: {})", bp.handler, bp.cave_exec);
        let handler = BoundHandler {
            key: bp.handler,
            func,
            info: bp.info,
        };
        Ok(Some((handler, bp.cavesize.unwrap_or(0))))
    }

    /// Installs one breakpoint, returning the number of overwritten bytes
    ///
    /// # Safety
    ///
    /// See [`InstalledBreakpoint::install`]
    unsafe fn install(
        &mut self,
        address: usize,
        handlers: Vec<BoundHandler>,
        min_len: usize,
    ) -> Result<usize, EngineError> {
        if self.installed.contains_key(&address) {
            return Err(BreakpointError::AlreadyBound { address }.into());
        }
        let scan = Scan::new(address, min_len, self.options.scan_limit)?;
        let end = address + scan.len();
        if let Some(other) = self
            .installed
            .values()
            .find(|bp| bp.range().start < end && address < bp.range().end)
        {
            return Err(BreakpointError::Overlapping {
                address,
                other: other.address(),
            }
            .into());
        }

        let trampoline = match self.trampoline {
            Some(trampoline) => trampoline,
            None => {
                let trampoline = Trampoline::install(&mut self.caves, address, &self.table)?;
                self.trampoline = Some(trampoline);
                trampoline
            }
        };

        let bp = InstalledBreakpoint::install(
            address,
            scan,
            handlers,
            &mut self.caves,
            &self.table,
            trampoline.address(),
            &self.memory,
        )?;
        let len = bp.overwritten_len();
        self.installed.insert(address, bp);
        // threads may still be inside the cave after removal
        self.caves_in_use = true;
        Ok(len)
    }

    /// Takes every breakpoint out again.
    ///
    /// A breakpoint whose bytes were changed by someone else since is left in place and keeps
    /// working. Removed breakpoints keep their caves, so a thread that already entered one
    /// carries on through the relocated instructions. Returns whether every breakpoint was
    /// removed.
    pub fn remove_all(&mut self) -> bool {
        let mut ok = true;
        for (address, bp) in std::mem::take(&mut self.installed) {
            match bp.remove() {
                Ok(()) => {
                    self.table.retire(address);
                    log::info!("Removed breakpoint at {address:#x}");
                }
                Err(e) => {
                    log::warn!("Not removing breakpoint at {address:#x}: {e}");
                    ok = false;
                }
            }
        }
        ok
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let removed = self.remove_all();
        if removed && !self.caves_in_use {
            // Safety: not used again, and nothing refers to the caves or the table anymore
            unsafe {
                ManuallyDrop::drop(&mut self.caves);
                ManuallyDrop::drop(&mut self.table);
            }
        } else {
            log::debug!("Keeping code caves alive, code may still run in them");
        }
    }
}
