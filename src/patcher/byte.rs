//! This module contains a byte patcher

use std::convert::Infallible;
use std::{ptr, slice};

use thiserror::Error;

use super::{PatchGuard, Patcher};

/// The patched bytes no longer hold what the patch wrote
#[derive(Debug, Error)]
#[error("bytes at {location:#x} changed after patching, leaving them untouched")]
pub struct PatchModified {
    /// Location of the patch
    pub location: usize,
}

/// Patcher for patching memory locations with byte arrays.
/// This patcher never fails.
#[derive(Default)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;
    type Guard = BytePatchGuard;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        Ok(BytePatchGuard::patch(location, patch))
    }
}

/// Guard for byte-patches
///
/// See [`BytePatcher`].
pub struct BytePatchGuard {
    /// Original data from `location`
    original: Vec<u8>,
    /// Data written to `location`
    patched: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
    /// Whether the guard still owns the patch. Cleared once restored or committed.
    armed: bool,
}
impl BytePatchGuard {
    /// Patches a location, returning a guard for unpatching
    ///
    /// # Safety
    ///
    /// `location` must be a valid pointer
    unsafe fn patch(location: *mut u8, patch: &[u8]) -> Self {
        // Safety: caller must pass in a `location` pointer that is valid for the full length of the patch
        let original = slice::from_raw_parts(location, patch.len()).to_vec();

        let guard = Self {
            original,
            patched: patch.to_vec(),
            location,
            armed: true,
        };

        // Safety: caller must ensure that `location` is writable
        ptr::copy(patch.as_ptr(), location, patch.len());

        guard
    }

    /// Writes the original bytes back if the location still holds the patch
    ///
    /// # Safety
    ///
    /// `location` must still be valid and writable for the full length of the patch
    unsafe fn unpatch(&mut self) -> Result<(), PatchModified> {
        if !self.armed {
            return Ok(());
        }
        self.armed = false;

        let current = slice::from_raw_parts(self.location, self.patched.len());
        if current != self.patched.as_slice() {
            return Err(PatchModified {
                location: self.location as usize,
            });
        }
        ptr::copy(self.original.as_ptr(), self.location, self.original.len());
        Ok(())
    }
}
unsafe impl PatchGuard for BytePatchGuard {
    type Error = PatchModified;

    fn restore(mut self) -> Result<(), Self::Error> {
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        unsafe { self.unpatch() }
    }

    fn commit(mut self) {
        self.armed = false;
    }

    fn location(&self) -> usize {
        self.location as usize
    }

    fn original(&self) -> &[u8] {
        &self.original
    }
}
impl Drop for BytePatchGuard {
    fn drop(&mut self) {
        // Safety: creator must pass in a `location` pointer that is valid and writable for the full length of the patch
        if let Err(e) = unsafe { self.unpatch() } {
            log::warn!("{e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::{PatchGuard, Patcher};

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();
        let size = vec.len();

        // get our patcher to test
        let patcher = BytePatcher::new();

        // patch the vec's data
        let patch = unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [4, 3, 2, 1]);
        assert_eq!(patch.original(), [1, 2, 3, 4]);

        // restore the patch
        patch.restore().unwrap();

        // make sure the patch was restored
        assert_eq!(vec, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();
        let size = vec.len();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr.add(1), &[5, 5]).unwrap() };
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [1, 5, 5, 4]);

        // dropping the guard restores as well
        drop(patch);
        assert_eq!(vec, [1, 2, 3, 4]);
    }

    #[test]
    /// Committed patches stay in place
    fn test_commit() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[9, 9]).unwrap() };
        patch.commit();

        assert_eq!(vec, [9, 9, 3, 4]);
    }

    #[test]
    /// Somebody else wrote over our patch, so it must not be restored
    fn test_restore_modified() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();

        let patcher = BytePatcher::new();
        let patch = unsafe { patcher.patch(ptr, &[9, 9]).unwrap() };
        unsafe { ptr.add(1).write(7) };

        let err = patch.restore().unwrap_err();
        assert_eq!(err.location, ptr as usize);
        assert_eq!(vec, [9, 7, 3, 4]);
    }
}
