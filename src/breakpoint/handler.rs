//! Handler registration
//!
//! Handlers are plain functions registered under their exported name, which must start with
//! [`HANDLER_PREFIX`]. Configuration refers to them without the prefix, optionally followed by
//! `#` and anything else so that one handler can be bound several times:
//!
//! ```
//! use hackpoints::breakpoint::{handler::HandlerDirectory, regs::RegisterSnapshot, Resume};
//!
//! fn bp_nothing(_regs: &mut RegisterSnapshot, _info: &serde_json::Value) -> Resume {
//!     Resume::Continue
//! }
//!
//! let mut handlers = HandlerDirectory::new();
//! handlers.register("BP_nothing", bp_nothing).unwrap();
//! assert!(handlers.lookup("nothing#second").is_ok());
//! assert!(handlers.lookup("Nothing").is_err());
//! ```

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use super::regs::RegisterSnapshot;
use super::Resume;

/// Prefix every exported handler name carries
pub const HANDLER_PREFIX: &str = "BP_";

/// A breakpoint handler.
///
/// Receives the registers of the thread that hit the breakpoint and the breakpoint's entry from
/// the configuration. Handlers can run on any thread, concurrently with themselves.
pub type Handler = fn(&mut RegisterSnapshot, &Value) -> Resume;

/// Errors while registering or looking up handlers
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// No handler is registered under the name
    #[error("no handler named `BP_{0}`")]
    HandlerNotFound(String),
    /// The exported name lacks the required prefix
    #[error("handler name `{0}` doesn't start with `BP_`")]
    InvalidName(String),
}

/// Name to handler table, filled once before the engine starts
#[derive(Clone, Default)]
pub struct HandlerDirectory {
    /// Handlers by exported name
    handlers: HashMap<String, Handler>,
}

impl fmt::Debug for HandlerDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerDirectory {
    /// Creates an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its exported name
    pub fn register(&mut self, exported_name: &str, handler: Handler) -> Result<(), HandlerError> {
        if !exported_name.starts_with(HANDLER_PREFIX) || exported_name.len() == HANDLER_PREFIX.len()
        {
            return Err(HandlerError::InvalidName(exported_name.to_owned()));
        }
        if self
            .handlers
            .insert(exported_name.to_owned(), handler)
            .is_some()
        {
            log::warn!("Handler {exported_name} registered twice, keeping the last one");
        }
        Ok(())
    }

    /// Builder style [`HandlerDirectory::register`]
    pub fn with(mut self, exported_name: &str, handler: Handler) -> Result<Self, HandlerError> {
        self.register(exported_name, handler)?;
        Ok(self)
    }

    /// Finds the handler a configuration key refers to
    pub fn lookup(&self, key: &str) -> Result<Handler, HandlerError> {
        let name = handler_name(key);
        self.handlers
            .get(&format!("{HANDLER_PREFIX}{name}"))
            .copied()
            .ok_or_else(|| HandlerError::HandlerNotFound(name.to_owned()))
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Handler name of a configuration key: everything before the first `#`
pub fn handler_name(key: &str) -> &str {
    key.split_once('#').map_or(key, |(name, _)| name)
}
