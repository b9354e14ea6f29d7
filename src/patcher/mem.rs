//! This module contains a patcher which adjusts memory permissions to patch read-only data

use region::Protection;
use thiserror::Error;

use super::{PatchGuard, Patcher};

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections: {0}")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// As always, casting a `&T` or `&mut T` to a `*mut u8` for use with `PermissionWrapper` can result in  undefined behavior because rust assumes `&T` will never change and `&mut T` will only be changed via that reference.
/// The `*mut u8` **MUST** be memory not tracked by Rust, or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
#[derive(Default)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

/// Converts a const pointer to a mutable pointer to be passed into our [`Patcher::patch`] implementation.
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// It is **NOT** safe to treat the returned value as mutable, as this function does not change memory permissions.
///
/// This function should **ONLY** be called in conjunction with our [`Patcher::patch`] implementation, which properly changes the memory permissions.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}

unsafe impl<P: Patcher> Patcher for PermissionWrapper<P> {
    type Error = PermissionError<P::Error>;
    type Guard = PermissionWrapperGuard<P::Guard>;

    unsafe fn patch(&self, location: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error> {
        // The handle puts the old protection back when it goes out of scope, whether or not the patch went through
        let _handle = region::protect_with_handle(location, patch.len(), Protection::all())?;
        self.patcher
            .patch(location, patch)
            .map(|g| PermissionWrapperGuard::guard(g, location, patch.len()))
            .map_err(PermissionError::CustomError)
    }
}

/// Permission guard for the underlying patch guard
pub struct PermissionWrapperGuard<G: PatchGuard> {
    /// Underlying patch guard for the wrapped patcher. `Option` so that we can drop it in our [`Drop::drop`] impl
    guard: Option<G>,
    /// Location of the patch
    location: *const u8,
    /// Length of the patch
    len: usize,
}
impl<G: PatchGuard> PermissionWrapperGuard<G> {
    /// Wrap a patcher's guard. When this guard is dropped, the underlying guard will also be dropped with its target location made writable
    fn guard(guard: G, location: *const u8, len: usize) -> Self {
        let guard = Some(guard);
        Self {
            guard,
            location,
            len,
        }
    }

    /// Length of the patch
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the patch is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
unsafe impl<G: PatchGuard> PatchGuard for PermissionWrapperGuard<G> {
    type Error = PermissionError<G::Error>;

    fn restore(mut self) -> Result<(), Self::Error> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let _handle = match unsafe {
            region::protect_with_handle(self.location, self.len, Protection::all())
        } {
            Ok(handle) => handle,
            Err(e) => {
                // Can't write there anymore, so leave the patch in place
                guard.commit();
                return Err(e.into());
            }
        };
        guard.restore().map_err(PermissionError::CustomError)
    }

    fn commit(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.commit();
        }
    }

    fn location(&self) -> usize {
        self.location as usize
    }

    fn original(&self) -> &[u8] {
        self.guard.as_ref().map(G::original).unwrap_or_default()
    }
}

impl<G: PatchGuard> Drop for PermissionWrapperGuard<G> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        match unsafe { region::protect_with_handle(self.location, self.len, Protection::all()) } {
            // The underlying guard restores in its own drop, while the location is writable
            Ok(_handle) => drop(guard),
            Err(e) => {
                log::error!(
                    "Can't unprotect {:#x} to restore it: {e}",
                    self.location as usize
                );
                guard.commit();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::slice;

    use region::Protection;

    use crate::patcher::byte::BytePatcher;
    use crate::patcher::mem::{to_mut, PermissionWrapper};
    use crate::patcher::PatchGuard;
    use crate::patcher::Patcher;

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut vec = vec![1u8, 2, 3, 4];
        let ptr = vec.as_mut_ptr();
        let size = vec.len();

        // create the patcher and wrapper
        let patcher = BytePatcher::new();
        let wrapper = PermissionWrapper::new(patcher);

        // patch the vec's data
        let patch = unsafe { wrapper.patch(ptr, &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [4, 3, 2, 1]);

        // restore the patch
        patch.restore().unwrap();

        // make sure the patch was restored
        assert_eq!(vec, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests to ensure permissions are actually set
    fn test_perms() {
        // Global immutables are stored in a read-only section in the binary.
        // Normally, writing to this global would result in a segfault, but PermissionWrapper changes the permissions to be writable so that no fault occurs
        static DATA: [u8; 4] = *b"1234";

        // black_box so the reads below aren't folded into constants
        let ptr = std::hint::black_box(DATA.as_ptr());
        let size = DATA.len();

        // sanity check
        // make sure the data is what we expect and that the data is definitely read-only
        assert_eq!(
            unsafe { slice::from_raw_parts(ptr, size) },
            [b'1', b'2', b'3', b'4']
        );
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), Protection::READ);
        }

        // create the patcher and wrapper
        let wrapper = PermissionWrapper::new(BytePatcher::new());

        // patch the data
        let patch = unsafe { wrapper.patch(to_mut(ptr), &[4, 3, 2, 1]).unwrap() };

        // make sure the data was actually changed
        assert_eq!(unsafe { slice::from_raw_parts(ptr, size) }, [4, 3, 2, 1]);

        // make sure permissions reverted correctly after the patch
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), Protection::READ);
        }

        // restore the patch
        patch.restore().unwrap();

        // make sure the patch was restored
        assert_eq!(
            unsafe { slice::from_raw_parts(ptr, size) },
            [b'1', b'2', b'3', b'4']
        );

        // make sure permissions were restored
        for region in region::query_range(ptr, size).unwrap() {
            let region = region.unwrap();
            assert!(!region.is_guarded());
            assert_eq!(region.protection(), Protection::READ);
        }
    }
}
