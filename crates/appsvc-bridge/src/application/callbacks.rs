//! Native-side callback registrations.
//!
//! The native side registers two functions:
//!
//! - a **call callback** that receives an encoded call buffer and returns an
//!   acknowledgment buffer;
//! - a **return callback** that receives the `(request_id, result, error)`
//!   triple of every completed call.
//!
//! Buffers are NUL-terminated UTF-8.  The bridge owns every buffer it passes
//! in and frees it once the callback returns; the call callback's
//! acknowledgment is owned by the bridge from the moment it is returned.

use std::ffi::{CStr, CString};
use std::sync::{Arc, PoisonError, RwLock};

/// Handles one encoded call and returns its acknowledgment.
pub type CallCallback = Arc<dyn Fn(&CStr) -> CString + Send + Sync>;

/// Receives `(request_id, result, error)` for one completed call.
pub type ReturnCallback = Arc<dyn Fn(&CStr, &CStr, &CStr) + Send + Sync>;

/// Holds the current registrations.  Registration is last-write-wins and a
/// registration is never reset.
#[derive(Default)]
pub struct CallbackRegistry {
    call: RwLock<Option<CallCallback>>,
    ret: RwLock<Option<ReturnCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the call callback.  Returns `true` if one was already set.
    pub fn set_call(&self, callback: CallCallback) -> bool {
        // Slots only ever hold a complete `Arc`, so a poisoned lock still
        // guards a valid value.
        let mut slot = self.call.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(callback).is_some()
    }

    /// Replaces the return callback.  Returns `true` if one was already set.
    pub fn set_return(&self, callback: ReturnCallback) -> bool {
        let mut slot = self.ret.write().unwrap_or_else(PoisonError::into_inner);
        slot.replace(callback).is_some()
    }

    /// Snapshot of the call callback, cloned out so the lock is not held
    /// while native code runs.
    pub fn call_callback(&self) -> Option<CallCallback> {
        self.call
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn return_callback(&self) -> Option<ReturnCallback> {
        self.ret
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("call", &self.call_callback().is_some())
            .field("return", &self.return_callback().is_some())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
