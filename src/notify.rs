//! Application notification callbacks
//!
//! Streams report data movement and faults to the application through
//! optional callbacks. They run on the realtime thread, so the contract
//! is strict: return quickly and never block. A callback that takes a
//! lock held elsewhere stalls the stream it serves.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

/// Invoked after a capture callback buffers new data.
pub type DataAvailableFn = dyn Fn() + Send + Sync;

/// Invoked after a playback callback renders a block; the argument is the
/// number of frames emitted to the device, silence included.
pub type DataNeededFn = dyn Fn(usize) + Send + Sync;

/// Invoked when the backend reports dropped capture data.
pub type OverflowFn = dyn Fn() + Send + Sync;

/// Invoked when the backend reports a playback gap.
pub type UnderflowFn = dyn Fn() + Send + Sync;

/// Callbacks for a capture stream.
#[derive(Default, Clone)]
pub struct InputNotify {
    pub data_available: Option<Arc<DataAvailableFn>>,
    pub overflow: Option<Arc<OverflowFn>>,
}

/// Callbacks for a playback stream.
#[derive(Default, Clone)]
pub struct OutputNotify {
    pub data_needed: Option<Arc<DataNeededFn>>,
    pub underflow: Option<Arc<UnderflowFn>>,
}

/// Serializes callback invocations for one stream and contains panics.
///
/// At most one notification runs at a time; a second realtime thread
/// reaching the invoker waits for the first. A panicking callback is
/// caught and counted instead of unwinding into the audio thread.
pub struct CallbackInvoker {
    guard: Mutex<()>,
    panics: AtomicU64,
}

impl CallbackInvoker {
    pub fn new() -> Self {
        Self {
            guard: Mutex::new(()),
            panics: AtomicU64::new(0),
        }
    }

    /// Runs `f` under the serialization guard. Returns false if `f`
    /// panicked.
    pub fn invoke(&self, f: impl FnOnce()) -> bool {
        let _held = self.guard.lock();
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(_) => {
                self.panics.fetch_add(1, Ordering::Relaxed);
                error!("notification callback panicked");
                false
            }
        }
    }

    /// Number of callback panics caught so far.
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }
}

impl Default for CallbackInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_runs_the_closure() {
        let invoker = CallbackInvoker::new();
        let mut ran = false;
        assert!(invoker.invoke(|| ran = true));
        assert!(ran);
    }

    #[test]
    fn panicking_callback_is_contained_and_counted() {
        let invoker = CallbackInvoker::new();
        assert!(!invoker.invoke(|| panic!("callback bug")));
        assert_eq!(invoker.panic_count(), 1);
        // the guard is released again
        assert!(invoker.invoke(|| ()));
        assert_eq!(invoker.panic_count(), 1);
    }

    #[test]
    fn guard_is_held_during_invocation() {
        let invoker = CallbackInvoker::new();
        invoker.invoke(|| {
            assert!(invoker.guard.is_locked());
        });
        assert!(!invoker.guard.is_locked());
    }
}
