//! Thread-safe allocator for transport frame ids.
//!
//! Every `request` frame carries an id that the peer echoes back in its
//! `response`.  Ids only need to be unique among the requests that are still
//! in flight on one connection, so a wrapping atomic counter is enough.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing, lock-free frame id source.
///
/// # Examples
///
/// ```rust
/// use appsvc_core::protocol::FrameIdCounter;
///
/// let ids = FrameIdCounter::new();
/// assert_eq!(ids.next(), 1);
/// assert_eq!(ids.next(), 2);
/// ```
#[derive(Debug)]
pub struct FrameIdCounter {
    inner: AtomicU64,
}

impl FrameIdCounter {
    /// Creates a counter whose first id is 1.
    ///
    /// Id 0 is never handed out so that a zero in a log line always means
    /// "no id".
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next id, skipping 0 when the counter wraps.
    pub fn next(&self) -> u64 {
        loop {
            // `Relaxed` is enough: ids carry no memory-ordering meaning.
            let id = self.inner.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

impl Default for FrameIdCounter {
    fn default() -> Self {
        Self::new()
    }
}
