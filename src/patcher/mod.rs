//! # Patch
//!
//! This module covers patchers, which are used to overwrite and restore locations in memory.
//!
//! [`TargetMemory`] is the patcher the engine uses for every write into the host process: it makes
//! the target writable for exactly as long as the write takes and keeps the overwritten bytes so
//! the write can be undone later.

use std::slice;

pub mod byte;
pub mod mem;

/// Patcher for code and data of the running process
pub type TargetMemory = mem::PermissionWrapper<byte::BytePatcher>;
/// Guard of a [`TargetMemory`] write
pub type TargetPatch = mem::PermissionWrapperGuard<byte::BytePatchGuard>;

/// All patchers save state from where they patched and are able to revert on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that the implementation of `patch` works correctly and is properly documented for avoiding undefined behavior
pub unsafe trait Patcher {
    /// Error type that can occur when patching
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard: PatchGuard;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but must be valid for the supplied patcher
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<Self::Guard, Self::Error>;

    /// Copies `len` bytes from `target`
    ///
    /// # Safety
    ///
    /// `target` must be readable for `len` bytes
    unsafe fn read(&self, target: *const u8, len: usize) -> Vec<u8> {
        slice::from_raw_parts(target, len).to_vec()
    }
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, unless it was committed
pub unsafe trait PatchGuard: Sized {
    /// Error when the original bytes can't be put back
    type Error;

    /// Restores the original value of a patch
    fn restore(self) -> Result<(), Self::Error>;

    /// Makes the patch permanent. The original bytes are forgotten.
    fn commit(self);

    /// Location that was patched
    fn location(&self) -> usize;

    /// Bytes that were at the location before the patch
    fn original(&self) -> &[u8];
}
