//! Cooperative thread interruption.
//!
//! Every thread lazily gets an interrupt flag. Another thread holding an
//! [`InterruptHandle`] can raise that flag and unpark the target, which makes
//! blocking waits such as [`InvocationFuture::get`](crate::future::InvocationFuture::get)
//! return early with an interruption error. Nothing is ever forcibly stopped:
//! code that never checks the flag is unaffected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, Thread};

#[derive(Debug)]
struct InterruptState {
    interrupted: AtomicBool,
    thread: Thread,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState {
        interrupted: AtomicBool::new(false),
        thread: thread::current(),
    });
}

/// Handle used to interrupt a specific thread.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    state: Arc<InterruptState>,
}

impl InterruptHandle {
    /// Returns the handle of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|state| Self {
            state: Arc::clone(state),
        })
    }

    /// Raises the target thread's interrupt flag and wakes it if parked.
    pub fn interrupt(&self) {
        self.state.interrupted.store(true, Ordering::SeqCst);
        self.state.thread.unpark();
    }

    /// Reads the target thread's interrupt flag without clearing it.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.state.interrupted.load(Ordering::SeqCst)
    }

    /// Name of the target thread, if it has one.
    #[must_use]
    pub fn thread_name(&self) -> Option<&str> {
        self.state.thread.name()
    }
}

/// Returns `true` if the calling thread's interrupt flag is set.
#[must_use]
pub fn is_interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.load(Ordering::SeqCst))
}

/// Returns the calling thread's interrupt flag and clears it.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.interrupted.swap(false, Ordering::SeqCst))
}

/// Sets the calling thread's interrupt flag.
pub fn set_interrupted() {
    CURRENT.with(|state| state.interrupted.store(true, Ordering::SeqCst));
}
