#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod breakpoint;
pub mod code;
pub mod engine;
pub mod hack;
pub mod patcher;

pub use crate::breakpoint::{HandlerDirectory, RegisterSnapshot, Resume};
pub use crate::engine::{count, Engine, EngineError, EngineOptions};
