//! # Code caves
//!
//! Executable memory owned by the engine. A cave either holds the instructions a breakpoint moved
//! out of the way, or the rendered code of a hack that doesn't fit at its target.
//!
//! Caves are placed within [`CAVE_RANGE`] of the address that will reference them and are never
//! moved, resized or freed individually. Everything is released at once when the
//! [`CaveAllocator`] is dropped.

use std::collections::HashMap;

use thiserror::Error;

use crate::code::INT3;
use crate::hack::expr::Symbols;

use self::proximity::{Allocation, ProximityAllocator, ProximityError};

pub mod proximity;
pub mod search;

/// The furthest distance between a cave and the code referencing it (2 GiB), so that `rel32`
/// displacements always reach
pub const CAVE_RANGE: usize = 0x8000_0000;

/// Errors while reserving code caves
#[derive(Debug, Error)]
pub enum CaveError {
    /// Another cave was already registered under this name
    #[error("code cave `{0}` already exists")]
    DuplicateName(String),
    /// No executable memory could be reserved
    #[error("can't allocate {size} bytes for code cave `{name}`: {source}")]
    CaveAllocationFailed {
        /// Name of the cave, or `<anonymous>`
        name: String,
        /// Requested size
        size: usize,
        /// Underlying allocation error
        #[source]
        source: ProximityError,
    },
}

/// Owner of every code cave of an engine
pub struct CaveAllocator {
    /// Allocated caves. Declared before `allocator` so they are released before their pools.
    caves: Vec<Allocation>,
    /// Named caves, as indices into `caves`
    names: HashMap<String, usize>,
    /// Pools the caves are taken from
    allocator: ProximityAllocator,
}

impl Default for CaveAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CaveAllocator {
    /// Creates an allocator without any caves
    pub fn new() -> Self {
        Self::with_range(CAVE_RANGE)
    }

    /// Creates an allocator placing caves at most `max_distance` bytes from their origin
    pub fn with_range(max_distance: usize) -> Self {
        Self {
            caves: Vec::new(),
            names: HashMap::new(),
            allocator: ProximityAllocator::new(max_distance),
        }
    }

    /// Reserves at least `size` bytes of executable, writable memory close to `origin`.
    ///
    /// Named caves can later be referenced from hacks. The returned cave is filled with `int3`.
    pub fn allocate(
        &mut self,
        name: Option<&str>,
        origin: usize,
        size: usize,
    ) -> Result<&mut [u8], CaveError> {
        if let Some(name) = name {
            if self.names.contains_key(name) {
                return Err(CaveError::DuplicateName(name.to_owned()));
            }
        }

        let mut cave = self
            .allocator
            .allocate(origin, size.max(1))
            .map_err(|source| CaveError::CaveAllocationFailed {
                name: name.unwrap_or("<anonymous>").to_owned(),
                size,
                source,
            })?;
        cave.fill(INT3);

        let index = self.caves.len();
        if let Some(name) = name {
            self.names.insert(name.to_owned(), index);
        }
        self.caves.push(cave);
        log::debug!(
            "Allocated code cave {} ({size} bytes) at {:#x}",
            name.unwrap_or("<anonymous>"),
            self.caves[index].as_ptr() as usize
        );
        Ok(&mut self.caves[index])
    }

    /// Address of the cave registered under `name`
    pub fn address(&self, name: &str) -> Option<usize> {
        self.names
            .get(name)
            .map(|&index| self.caves[index].as_ptr() as usize)
    }

    /// Contents of the cave registered under `name`
    pub fn get_mut(&mut self, name: &str) -> Option<&mut [u8]> {
        let index = *self.names.get(name)?;
        Some(&mut self.caves[index])
    }

    /// Number of caves, named or not
    pub fn len(&self) -> usize {
        self.caves.len()
    }

    /// Whether no cave was allocated yet
    pub fn is_empty(&self) -> bool {
        self.caves.is_empty()
    }
}

impl Symbols for CaveAllocator {
    fn symbol(&self, name: &str) -> Option<usize> {
        self.address(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_cave() {
        let mut caves = CaveAllocator::new();
        let origin = test_named_cave as usize;

        let cave = caves.allocate(Some("text"), origin, 32).unwrap();
        assert_eq!(cave.len(), 32);
        assert!(cave.iter().all(|&b| b == INT3));
        let address = cave.as_ptr() as usize;

        assert_eq!(caves.address("text"), Some(address));
        assert_eq!(caves.symbol("text"), Some(address));
        assert_eq!(caves.address("missing"), None);

        caves.get_mut("text").unwrap()[0] = 0x90;
        assert_eq!(unsafe { *(address as *const u8) }, 0x90);
    }

    #[test]
    fn test_duplicate_name() {
        let mut caves = CaveAllocator::new();
        let origin = test_duplicate_name as usize;

        caves.allocate(Some("twice"), origin, 8).unwrap();
        let err = caves.allocate(Some("twice"), origin, 8).unwrap_err();
        assert!(matches!(err, CaveError::DuplicateName(name) if name == "twice"));
        assert_eq!(caves.len(), 1);
    }

    #[test]
    /// Nothing is free within a zero distance, and a failed cave leaves no name behind
    fn test_allocation_failed() {
        let mut caves = CaveAllocator::with_range(0);
        let origin = test_allocation_failed as usize;

        let err = caves.allocate(Some("nowhere"), origin, 16).unwrap_err();
        assert!(matches!(
            err,
            CaveError::CaveAllocationFailed { ref name, size: 16, .. } if name == "nowhere"
        ));
        assert!(caves.is_empty());
        assert_eq!(caves.address("nowhere"), None);
    }

    #[test]
    /// Caves never move once allocated
    fn test_caves_are_stable() {
        let mut caves = CaveAllocator::new();
        let origin = test_caves_are_stable as usize;

        let first = caves.allocate(Some("first"), origin, 8).unwrap().as_ptr() as usize;
        for _ in 0..64 {
            caves.allocate(None, origin, 100).unwrap();
        }
        assert_eq!(caves.address("first"), Some(first));
    }
}
