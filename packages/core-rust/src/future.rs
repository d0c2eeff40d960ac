//! Single-slot asynchronous result cell for submitted operations.
//!
//! An [`InvocationFuture`] starts unresolved and moves exactly once to a
//! terminal state: a value or a failure. The state lives in one `ArcSwap`
//! cell and every transition is a compare-and-swap, so completing threads
//! (usually partition threads) never block on a lock.
//!
//! While unresolved, the state carries an immutable stack of waiters: parked
//! joiner threads and registered callbacks. Registering pushes a new node by
//! swapping in a new state; completing swaps in the terminal state and then
//! drains the stack it replaced. A waiter therefore either lands in a stack
//! that the completer will drain, or observes the terminal state itself.
//!
//! # State machine
//!
//! ```text
//! Unresolved(stack) --complete--------------> Value(T)
//!                   --complete_exceptionally-> Failure(Cause)
//! ```
//!
//! Terminal states are never left; a second completion attempt is a no-op.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::interrupt;

/// Shared failure cause. The same instance is handed to every observer.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

type Callback<T> = Box<dyn FnOnce(Result<&T, &Cause>) + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error returned by the blocking [`InvocationFuture::get`] family.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GetError {
    /// The invocation completed exceptionally with this cause.
    #[error("invocation failed: {0}")]
    Failed(#[source] Cause),
    /// The waiting thread was interrupted. The future itself is untouched.
    #[error("interrupted while waiting for invocation result")]
    Interrupted,
    /// The wait exceeded the caller's timeout. The future itself is untouched.
    #[error("timed out after {0:?} waiting for invocation result")]
    Timeout(Duration),
}

impl GetError {
    /// The failure cause, if the invocation itself failed.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Failed(cause) => Some(cause),
            Self::Interrupted | Self::Timeout(_) => None,
        }
    }
}

/// Error returned by [`InvocationFuture::join`].
///
/// Wraps the original cause exactly once; the wrapped [`Cause`] is the same
/// instance passed to `complete_exceptionally`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("invocation completed exceptionally: {0}")]
    Failed(#[source] Cause),
    #[error("join interrupted")]
    Interrupted,
}

impl CompletionError {
    /// The failure cause, if the invocation itself failed.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Failed(cause) => Some(cause),
            Self::Interrupted => None,
        }
    }
}

/// Failure produced when user code panics inside a callback or mapping.
#[derive(Debug, thiserror::Error)]
#[error("panicked: {0}")]
pub struct PanicError(pub String);

/// Extracts a readable message from a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

enum Waiter<T> {
    Thread(Thread),
    /// Emptied exactly once, by whichever thread delivers the outcome.
    Callback(ArcSwapOption<CallbackCell<T>>),
}

struct CallbackCell<T>(Callback<T>);

struct WaitNode<T> {
    waiter: Arc<Waiter<T>>,
    next: Option<Arc<WaitNode<T>>>,
}

enum State<T> {
    Unresolved(Option<Arc<WaitNode<T>>>),
    Value(T),
    Failure(Cause),
}

impl<T> State<T> {
    fn outcome(&self) -> Option<Result<&T, &Cause>> {
        match self {
            Self::Unresolved(_) => None,
            Self::Value(value) => Some(Ok(value)),
            Self::Failure(cause) => Some(Err(cause)),
        }
    }
}

// ---------------------------------------------------------------------------
// InvocationFuture
// ---------------------------------------------------------------------------

/// Asynchronous handle to the eventual outcome of an invocation.
///
/// Cloning yields another handle to the same cell.
pub struct InvocationFuture<T> {
    state: Arc<ArcSwap<State<T>>>,
}

impl<T> Clone for InvocationFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for InvocationFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for InvocationFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &**self.state.load() {
            State::Unresolved(None) => "unresolved",
            State::Unresolved(Some(_)) => "waiting",
            State::Value(_) => "value",
            State::Failure(_) => "failure",
        };
        f.debug_struct("InvocationFuture")
            .field("state", &state)
            .finish()
    }
}

impl<T> InvocationFuture<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates an unresolved future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(State::Unresolved(None))),
        }
    }

    /// Creates a future already completed with `value`.
    #[must_use]
    pub fn completed(value: T) -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(State::Value(value))),
        }
    }

    /// Creates a future already completed with `cause`.
    #[must_use]
    pub fn failed(cause: Cause) -> Self {
        Self {
            state: Arc::new(ArcSwap::from_pointee(State::Failure(cause))),
        }
    }

    // --- Completion ---

    /// Completes the future with `value`.
    ///
    /// Returns `true` if this call performed the transition, `false` if the
    /// future was already terminal (in which case nothing changes).
    pub fn complete(&self, value: T) -> bool {
        self.transition(State::Value(value))
    }

    /// Completes the future with `cause`. First writer wins, as for
    /// [`complete`](Self::complete).
    pub fn complete_exceptionally(&self, cause: Cause) -> bool {
        self.transition(State::Failure(cause))
    }

    /// Convenience wrapper around [`complete_exceptionally`](Self::complete_exceptionally)
    /// for a concrete error value.
    pub fn fail<E>(&self, error: E) -> bool
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.complete_exceptionally(Arc::new(error))
    }

    fn transition(&self, terminal: State<T>) -> bool {
        let terminal = Arc::new(terminal);
        loop {
            let current = self.state.load_full();
            let State::Unresolved(stack) = &*current else {
                return false;
            };
            let previous = self
                .state
                .compare_and_swap(&current, Arc::clone(&terminal));
            if Arc::ptr_eq(&previous, &current) {
                drop(previous);
                Self::release(stack.clone(), &terminal);
                return true;
            }
        }
    }

    /// Wakes every waiter of a replaced stack, oldest registration first.
    fn release(stack: Option<Arc<WaitNode<T>>>, terminal: &State<T>) {
        let mut waiters = Vec::new();
        let mut cursor = stack;
        while let Some(node) = cursor {
            waiters.push(Arc::clone(&node.waiter));
            cursor = node.next.clone();
        }
        for waiter in waiters.iter().rev() {
            Self::notify(waiter, terminal);
        }
    }

    fn notify(waiter: &Waiter<T>, terminal: &State<T>) {
        match waiter {
            Waiter::Thread(thread) => thread.unpark(),
            Waiter::Callback(slot) => {
                // The slot is never loaded, so the swapped-out Arc is the only
                // reference left.
                let Some(CallbackCell(callback)) = slot.swap(None).and_then(Arc::into_inner)
                else {
                    return;
                };
                if let Some(outcome) = terminal.outcome() {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                        tracing::warn!(
                            panic = %panic_message(payload.as_ref()),
                            "invocation callback panicked"
                        );
                    }
                }
            }
        }
    }

    /// Pushes `waiter` onto the stack. Returns the terminal state instead if
    /// the future completed first.
    fn register(&self, waiter: &Arc<Waiter<T>>) -> Option<Arc<State<T>>> {
        loop {
            let current = self.state.load_full();
            let State::Unresolved(stack) = &*current else {
                return Some(current);
            };
            let node = Arc::new(WaitNode {
                waiter: Arc::clone(waiter),
                next: stack.clone(),
            });
            let next = Arc::new(State::Unresolved(Some(node)));
            let previous = self.state.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return None;
            }
        }
    }

    /// Takes `waiter` off the stack again after its wait was abandoned. A
    /// no-op once terminal: the completer owns the drained stack by then.
    fn deregister(&self, waiter: &Arc<Waiter<T>>) {
        loop {
            let current = self.state.load_full();
            let State::Unresolved(stack) = &*current else {
                return;
            };
            let Some(rest) = Self::unlink(stack.as_ref(), waiter) else {
                return;
            };
            let next = Arc::new(State::Unresolved(rest));
            let previous = self.state.compare_and_swap(&current, next);
            if Arc::ptr_eq(&previous, &current) {
                return;
            }
        }
    }

    /// Copy of `stack` without `waiter`'s node, `None` if it is not on it.
    /// Nodes below the removed one are shared, nodes above are rebuilt.
    #[allow(clippy::option_option)]
    fn unlink(
        stack: Option<&Arc<WaitNode<T>>>,
        waiter: &Arc<Waiter<T>>,
    ) -> Option<Option<Arc<WaitNode<T>>>> {
        let mut above = Vec::new();
        let mut cursor = stack;
        while let Some(node) = cursor {
            if Arc::ptr_eq(&node.waiter, waiter) {
                let rebuilt = above.into_iter().rev().fold(
                    node.next.clone(),
                    |next, kept: &Arc<WaitNode<T>>| {
                        Some(Arc::new(WaitNode {
                            waiter: Arc::clone(&kept.waiter),
                            next,
                        }))
                    },
                );
                return Some(rebuilt);
            }
            above.push(node);
            cursor = node.next.as_ref();
        }
        None
    }

    // --- Inspection ---

    /// Returns `true` once the future is terminal.
    #[must_use]
    pub fn is_done(&self) -> bool {
        !matches!(&**self.state.load(), State::Unresolved(_))
    }

    /// Returns `true` if the future completed with a failure.
    #[must_use]
    pub fn is_completed_exceptionally(&self) -> bool {
        matches!(&**self.state.load(), State::Failure(_))
    }

    /// Number of waiters (parked threads and pending callbacks) currently
    /// registered. Always zero once terminal. Intended for diagnostics.
    #[must_use]
    pub fn waiter_count(&self) -> usize {
        let state = self.state.load();
        let State::Unresolved(stack) = &**state else {
            return 0;
        };
        let mut count = 0;
        let mut cursor = stack.as_ref();
        while let Some(node) = cursor {
            count += 1;
            cursor = node.next.as_ref();
        }
        count
    }

    /// Returns the value if completed successfully, `default` if unresolved.
    ///
    /// # Errors
    ///
    /// Returns `CompletionError::Failed` if the future completed exceptionally.
    pub fn get_now(&self, default: T) -> Result<T, CompletionError> {
        match self.try_resolve() {
            None => Ok(default),
            Some(Ok(value)) => Ok(value),
            Some(Err(cause)) => Err(CompletionError::Failed(cause)),
        }
    }

    fn try_resolve(&self) -> Option<Result<T, Cause>> {
        let state = self.state.load();
        state
            .outcome()
            .map(|outcome| outcome.map(Clone::clone).map_err(Arc::clone))
    }

    // --- Blocking access ---

    /// Blocks until the future is terminal and returns its outcome.
    ///
    /// # Errors
    ///
    /// - `GetError::Failed` carrying the original cause if the invocation failed.
    /// - `GetError::Interrupted` if the calling thread is (or becomes)
    ///   interrupted while waiting. The interrupt flag stays set and the
    ///   future state is not touched, so other joiners keep waiting.
    pub fn get(&self) -> Result<T, GetError> {
        self.wait(None)
    }

    /// Like [`get`](Self::get) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), plus `GetError::Timeout` when the deadline passes.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, GetError> {
        self.wait(Some((Instant::now() + timeout, timeout)))
    }

    /// Blocks until the future is terminal; failures are wrapped once in a
    /// [`CompletionError`].
    ///
    /// # Errors
    ///
    /// - `CompletionError::Failed` wrapping the same cause instance.
    /// - `CompletionError::Interrupted` if the wait was interrupted. The
    ///   calling thread's interrupt flag is set on return in that case.
    pub fn join(&self) -> Result<T, CompletionError> {
        match self.get() {
            Ok(value) => Ok(value),
            Err(GetError::Failed(cause)) => Err(CompletionError::Failed(cause)),
            Err(GetError::Interrupted | GetError::Timeout(_)) => {
                interrupt::set_interrupted();
                Err(CompletionError::Interrupted)
            }
        }
    }

    fn wait(&self, deadline: Option<(Instant, Duration)>) -> Result<T, GetError> {
        if let Some(outcome) = self.try_resolve() {
            return outcome.map_err(GetError::Failed);
        }
        if interrupt::is_interrupted() {
            return Err(GetError::Interrupted);
        }

        let waiter = Arc::new(Waiter::Thread(thread::current()));
        if let Some(terminal) = self.register(&waiter) {
            return Self::resolve(&terminal);
        }

        let abandoned = loop {
            match deadline {
                None => thread::park(),
                Some((at, timeout)) => {
                    let now = Instant::now();
                    if now >= at {
                        break GetError::Timeout(timeout);
                    }
                    thread::park_timeout(at - now);
                }
            }
            if let Some(outcome) = self.try_resolve() {
                return outcome.map_err(GetError::Failed);
            }
            if interrupt::is_interrupted() {
                break GetError::Interrupted;
            }
        };
        self.deregister(&waiter);
        Err(abandoned)
    }

    fn resolve(terminal: &State<T>) -> Result<T, GetError> {
        match terminal.outcome() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(cause)) => Err(GetError::Failed(Arc::clone(cause))),
            // register only hands back terminal states
            None => Err(GetError::Interrupted),
        }
    }

    // --- Callbacks ---

    /// Registers `callback` to receive the outcome exactly once.
    ///
    /// If the future is already terminal the callback runs synchronously on
    /// the calling thread before this method returns; otherwise it runs on the
    /// thread that completes the future. A panicking callback is logged and
    /// does not affect other callbacks.
    pub fn when_complete<F>(&self, callback: F)
    where
        F: FnOnce(Result<&T, &Cause>) + Send + Sync + 'static,
    {
        let cell = CallbackCell(Box::new(callback) as Callback<T>);
        let waiter = Arc::new(Waiter::Callback(ArcSwapOption::from_pointee(cell)));
        if let Some(terminal) = self.register(&waiter) {
            Self::notify(&waiter, &terminal);
        }
    }

    /// Returns a future completed with `f(value)` once this one succeeds, or
    /// with the same cause once it fails.
    #[must_use]
    pub fn then_apply<U, F>(&self, f: F) -> InvocationFuture<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + Sync + 'static,
    {
        let derived = InvocationFuture::new();
        let target = derived.clone();
        self.when_complete(move |outcome| match outcome {
            Ok(value) => match catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(mapped) => {
                    target.complete(mapped);
                }
                Err(payload) => {
                    target.fail(PanicError(panic_message(payload.as_ref())));
                }
            },
            Err(cause) => {
                target.complete_exceptionally(Arc::clone(cause));
            }
        });
        derived
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};

    use parking_lot::Mutex;

    use super::*;
    use crate::interrupt::InterruptHandle;

    /// Stand-in for a checked, I/O-style failure.
    #[derive(Debug, thiserror::Error)]
    #[error("checked failure")]
    struct CheckedError;

    /// Stand-in for an unchecked, logic-style failure.
    #[derive(Debug, thiserror::Error)]
    #[error("runtime failure: {0}")]
    struct RuntimeError(&'static str);

    fn wait_for_waiters<T: Clone + Send + Sync + 'static>(f: &InvocationFuture<T>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while f.waiter_count() < n {
            assert!(Instant::now() < deadline, "waiters never registered");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn complete_then_get_returns_value() {
        let f = InvocationFuture::new();
        assert!(!f.is_done());
        assert!(f.complete(7_u32));
        assert!(f.is_done());
        assert_eq!(f.get().unwrap(), 7);
        assert_eq!(f.join().unwrap(), 7);
    }

    #[test]
    fn completion_is_idempotent_first_writer_wins() {
        let f = InvocationFuture::new();
        assert!(f.complete("first".to_string()));
        assert!(!f.complete("second".to_string()));
        assert!(!f.fail(RuntimeError("late")));
        assert_eq!(f.get().unwrap(), "first");
        assert!(!f.is_completed_exceptionally());
    }

    #[test]
    fn failure_after_failure_keeps_original_cause() {
        let f: InvocationFuture<u8> = InvocationFuture::new();
        let first: Cause = Arc::new(CheckedError);
        assert!(f.complete_exceptionally(Arc::clone(&first)));
        assert!(!f.complete_exceptionally(Arc::new(RuntimeError("again"))));
        assert!(!f.complete(1));
        let err = f.get().unwrap_err();
        assert!(Arc::ptr_eq(err.cause().unwrap(), &first));
    }

    #[test]
    fn get_surfaces_original_cause_instance() {
        let f: InvocationFuture<u8> = InvocationFuture::new();
        let cause: Cause = Arc::new(CheckedError);
        f.complete_exceptionally(Arc::clone(&cause));
        match f.get() {
            Err(GetError::Failed(got)) => assert!(Arc::ptr_eq(&got, &cause)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn join_wraps_checked_and_runtime_causes_once() {
        let checked: InvocationFuture<u8> = InvocationFuture::new();
        let checked_cause: Cause = Arc::new(CheckedError);
        checked.complete_exceptionally(Arc::clone(&checked_cause));

        let runtime: InvocationFuture<u8> = InvocationFuture::new();
        let runtime_cause: Cause = Arc::new(RuntimeError("boom"));
        runtime.complete_exceptionally(Arc::clone(&runtime_cause));

        let err = checked.join().unwrap_err();
        let cause = err.cause().unwrap();
        assert!(Arc::ptr_eq(cause, &checked_cause));
        assert!(cause.downcast_ref::<CheckedError>().is_some());
        assert!(cause.downcast_ref::<RuntimeError>().is_none());

        let err = runtime.join().unwrap_err();
        let cause = err.cause().unwrap();
        assert!(Arc::ptr_eq(cause, &runtime_cause));
        assert!(cause.downcast_ref::<RuntimeError>().is_some());

        // The wrapper's source is the cause itself, not another wrapper.
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "runtime failure: boom");
    }

    #[test]
    fn joining_thread_is_woken_by_completion() {
        let f = InvocationFuture::new();
        let joiner = {
            let f = f.clone();
            thread::spawn(move || f.join())
        };
        wait_for_waiters(&f, 1);
        f.complete(42_u64);
        assert_eq!(joiner.join().unwrap().unwrap(), 42);
        assert_eq!(f.waiter_count(), 0);
    }

    #[test]
    fn all_waiters_observe_same_outcome() {
        let f = InvocationFuture::new();
        let joiners: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                thread::spawn(move || f.get())
            })
            .collect();
        wait_for_waiters(&f, 8);
        f.complete(vec![1, 2, 3]);
        for joiner in joiners {
            assert_eq!(joiner.join().unwrap().unwrap(), vec![1, 2, 3]);
        }
    }

    #[test]
    fn callback_after_completion_runs_synchronously_once() {
        let f = InvocationFuture::completed(5_i32);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let caller = thread::current().id();
        {
            let calls = Arc::clone(&calls);
            f.when_complete(move |outcome| {
                calls.fetch_add(1, Ordering::SeqCst);
                tx.send((thread::current().id(), *outcome.unwrap())).unwrap();
            });
        }
        // Synchronous: already delivered before when_complete returned.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let (thread_id, value) = rx.try_recv().unwrap();
        assert_eq!(thread_id, caller);
        assert_eq!(value, 5);
        f.complete(6);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_before_completion_runs_on_completing_thread() {
        let f: InvocationFuture<i32> = InvocationFuture::new();
        let (tx, rx) = mpsc::channel();
        f.when_complete(move |outcome| {
            let failed = outcome.is_err();
            tx.send((thread::current().name().map(str::to_string), failed))
                .unwrap();
        });
        assert_eq!(f.waiter_count(), 1);
        let completer = {
            let f = f.clone();
            thread::Builder::new()
                .name("completer".to_string())
                .spawn(move || f.fail(RuntimeError("x")))
                .unwrap()
        };
        assert!(completer.join().unwrap());
        let (name, failed) = rx.recv().unwrap();
        assert_eq!(name.as_deref(), Some("completer"));
        assert!(failed);
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let f = InvocationFuture::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            f.when_complete(move |_| order.lock().push(i));
        }
        f.complete(());
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn concurrent_completers_deliver_callbacks_exactly_once() {
        for _ in 0..50 {
            let f = InvocationFuture::new();
            let calls = Arc::new(AtomicUsize::new(0));
            for _ in 0..4 {
                let calls = Arc::clone(&calls);
                f.when_complete(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                });
            }
            let barrier = Arc::new(Barrier::new(8));
            let winners: usize = (0..8)
                .map(|i| {
                    let f = f.clone();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        usize::from(f.complete(i))
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .sum();
            assert_eq!(winners, 1);
            assert_eq!(calls.load(Ordering::SeqCst), 4);
        }
    }

    #[test]
    fn racing_registration_and_completion_never_loses_a_callback() {
        for _ in 0..100 {
            let f = InvocationFuture::new();
            let calls = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));
            let registrar = {
                let f = f.clone();
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10 {
                        let calls = Arc::clone(&calls);
                        f.when_complete(move |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                        });
                    }
                })
            };
            barrier.wait();
            f.complete(1_u8);
            registrar.join().unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), 10);
        }
    }

    #[test]
    fn panicking_callback_does_not_block_others() {
        let f = InvocationFuture::new();
        let reached = Arc::new(AtomicUsize::new(0));
        f.when_complete(|_| panic!("callback failure"));
        {
            let reached = Arc::clone(&reached);
            f.when_complete(move |_| {
                reached.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(f.complete(1_u8));
        assert_eq!(reached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interrupted_join_sets_flag_and_leaves_future_untouched() {
        let f: InvocationFuture<u32> = InvocationFuture::new();
        let (tx, rx) = mpsc::channel();
        let joiner = {
            let f = f.clone();
            thread::spawn(move || {
                tx.send(InterruptHandle::current()).unwrap();
                let result = f.join();
                (result, interrupt::is_interrupted())
            })
        };
        let handle = rx.recv().unwrap();
        wait_for_waiters(&f, 1);
        handle.interrupt();

        let (result, flag) = joiner.join().unwrap();
        assert!(matches!(result, Err(CompletionError::Interrupted)));
        assert!(flag);
        assert!(!f.is_done());
        assert_eq!(f.waiter_count(), 0);

        // Other callers still see the real outcome later.
        f.complete(9);
        assert_eq!(f.get().unwrap(), 9);
    }

    #[test]
    fn interrupted_get_reports_interruption_and_keeps_flag() {
        let f: InvocationFuture<u32> = InvocationFuture::new();
        let observed = thread::spawn(move || {
            interrupt::set_interrupted();
            let result = f.get();
            (matches!(result, Err(GetError::Interrupted)), interrupt::is_interrupted())
        })
        .join()
        .unwrap();
        assert_eq!(observed, (true, true));
    }

    #[test]
    fn completed_future_wins_over_pending_interrupt() {
        let value = thread::spawn(|| {
            interrupt::set_interrupted();
            InvocationFuture::completed(3_u8).get()
        })
        .join()
        .unwrap();
        assert_eq!(value.unwrap(), 3);
    }

    #[test]
    fn get_timeout_expires_without_touching_state() {
        let f: InvocationFuture<u8> = InvocationFuture::new();
        let err = f.get_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, GetError::Timeout(_)));
        assert!(!f.is_done());
    }

    #[test]
    fn timed_out_gets_leave_no_waiters_behind() {
        let f: InvocationFuture<u8> = InvocationFuture::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = Arc::clone(&calls);
            f.when_complete(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        for _ in 0..1000 {
            let err = f.get_timeout(Duration::from_micros(1)).unwrap_err();
            assert!(matches!(err, GetError::Timeout(_)));
        }
        assert_eq!(f.waiter_count(), 1);

        f.complete(1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn abandoned_wait_below_newer_waiters_is_unlinked() {
        let f: InvocationFuture<u8> = InvocationFuture::new();
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let f = f.clone();
            thread::spawn(move || {
                tx.send(InterruptHandle::current()).unwrap();
                f.get()
            })
        };
        let handle = rx.recv().unwrap();
        wait_for_waiters(&f, 1);

        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            f.when_complete(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(f.waiter_count(), 4);

        handle.interrupt();
        assert!(matches!(waiter.join().unwrap(), Err(GetError::Interrupted)));
        assert_eq!(f.waiter_count(), 3);

        f.complete(2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn get_now_returns_default_until_done() {
        let f = InvocationFuture::new();
        assert_eq!(f.get_now(0_u8).unwrap(), 0);
        f.complete(4);
        assert_eq!(f.get_now(0).unwrap(), 4);

        let failed: InvocationFuture<u8> = InvocationFuture::failed(Arc::new(CheckedError));
        assert!(failed.get_now(0).is_err());
    }

    #[test]
    fn then_apply_maps_value_and_propagates_failure() {
        let f = InvocationFuture::new();
        let doubled = f.then_apply(|v: &u32| v * 2);
        f.complete(21);
        assert_eq!(doubled.join().unwrap(), 42);

        let g: InvocationFuture<u32> = InvocationFuture::new();
        let mapped = g.then_apply(|v| v + 1);
        let cause: Cause = Arc::new(RuntimeError("upstream"));
        g.complete_exceptionally(Arc::clone(&cause));
        let err = mapped.join().unwrap_err();
        assert!(Arc::ptr_eq(err.cause().unwrap(), &cause));
    }

    #[test]
    fn then_apply_panic_fails_derived_future() {
        let f = InvocationFuture::new();
        let mapped = f.then_apply(|_: &u8| -> u8 { panic!("mapping failed") });
        f.complete(1);
        let err = mapped.get().unwrap_err();
        let cause = err.cause().unwrap();
        assert!(cause.downcast_ref::<PanicError>().is_some());
    }

    proptest::proptest! {
        #[test]
        fn first_completion_wins_for_any_attempt_sequence(
            attempts in proptest::collection::vec(proptest::option::of(0_u16..1000), 1..20),
        ) {
            let f: InvocationFuture<u16> = InvocationFuture::new();
            let accepted: Vec<bool> = attempts
                .iter()
                .map(|attempt| match attempt {
                    Some(value) => f.complete(*value),
                    None => f.fail(RuntimeError("attempt")),
                })
                .collect();

            proptest::prop_assert!(accepted[0]);
            proptest::prop_assert!(accepted[1..].iter().all(|won| !won));
            match attempts[0] {
                Some(value) => proptest::prop_assert_eq!(f.get_now(0).unwrap(), value),
                None => proptest::prop_assert!(f.is_completed_exceptionally()),
            }
        }
    }

    #[test]
    fn debug_reports_state_name() {
        let f: InvocationFuture<u8> = InvocationFuture::new();
        assert!(format!("{f:?}").contains("unresolved"));
        f.when_complete(|_| {});
        assert!(format!("{f:?}").contains("waiting"));
        f.complete(1);
        assert!(format!("{f:?}").contains("value"));
    }
}
