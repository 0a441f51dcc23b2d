use std::any::Any;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{error, trace};

use crate::error::{Failure, FutureError};


/// Label given to futures constructed without one.
const DEFAULT_LABEL: &str = "unlabelled future";

/// Component recorded on failures that did not name one.
const UNKNOWN_COMPONENT: &str = "unknown";

/// A queued callback. Queued callbacks are drained exactly once, at the
/// resolving transition, so `FnOnce` is the right shape.
type Task<T> = Box<dyn FnOnce(&Future<T>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Pending = 0,
    Done = 1,
    Failed = 2,
    Cancelled = 3,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::Pending,
            1 => State::Done,
            2 => State::Failed,
            _ => State::Cancelled,
        }
    }

    fn name(self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Done => "done",
            State::Failed => "failed",
            State::Cancelled => "cancelled",
        }
    }
}

/// Mutable section of a future. Everything in here is written under the
/// owning future's mutex.
struct Shared<T> {
    value: Option<T>,
    failure: Option<Failure>,
    tasks: Vec<Task<T>>,
    resolved_at: Option<Instant>,
}

struct Inner<T> {
    /// Current state. Kept outside the mutex so inspection never blocks;
    /// transitions store it last, under the mutex, so a non-pending read
    /// guarantees the value and failure record are already in place.
    state: AtomicU8,
    shared: Mutex<Shared<T>>,
    label: String,
    created_at: Instant,
}

/// A write-once container for a deferred outcome.
///
/// A future starts `pending` and moves to exactly one of `done`, `failed` or
/// `cancelled`; the first terminal transition wins and later ones are ignored.
/// Callbacks registered before the transition are queued and fire in
/// registration order on the thread that performs the transition; callbacks
/// registered afterwards run immediately on the registering thread. Either
/// way each callback runs at most once.
///
/// `Future` is a handle: cloning it shares the same underlying cell, which is
/// how chained callbacks, aggregates and the original creator all observe one
/// resolution. The cell itself cannot be copied.
///
/// # Examples
///
/// ```rust
/// use sequent_core::future::Future;
///
/// let f = Future::with_label("answer");
/// f.on_done(|v: i32| assert_eq!(v, 42));
/// f.done(42);
/// assert!(f.is_done());
/// assert_eq!(f.value().unwrap(), 42);
/// ```
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("label", &self.inner.label)
            .field("state", &self.state().name())
            .finish()
    }
}

impl<T: Send + 'static> Default for Future<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Future<T> {
    fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }
}

impl<T: Send + 'static> Future<T> {
    /// Creates a new pending future with the default label.
    pub fn new() -> Future<T> {
        Self::with_label(DEFAULT_LABEL)
    }

    /// Creates a new pending future carrying a diagnostic label.
    pub fn with_label(label: impl Into<String>) -> Future<T> {
        let label = label.into();
        trace!(target: "sequent::future", label = %label, "future created");
        Future {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::Pending as u8),
                shared: Mutex::new(Shared {
                    value: None,
                    failure: None,
                    tasks: Vec::new(),
                    resolved_at: None,
                }),
                label,
                created_at: Instant::now(),
            }),
        }
    }

    /// Returns true while no terminal transition has happened.
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), State::Pending)
    }

    /// Returns true once the future has resolved, whatever the outcome.
    pub fn is_ready(&self) -> bool {
        !self.is_pending()
    }

    /// Returns true if the future completed successfully.
    pub fn is_done(&self) -> bool {
        matches!(self.state(), State::Done)
    }

    /// Returns true if the future failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.state(), State::Failed)
    }

    /// Returns true if the future was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.state(), State::Cancelled)
    }

    /// The diagnostic label given at construction.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The current state as a string: `pending`, `done`, `failed` or
    /// `cancelled`.
    pub fn current_state(&self) -> &'static str {
        self.state().name()
    }

    /// Time since construction, frozen at the resolving transition.
    pub fn elapsed(&self) -> Duration {
        let end = self.inner.shared.lock().resolved_at.unwrap_or_else(Instant::now);
        end.duration_since(self.inner.created_at)
    }

    /// One-line description: label, state and elapsed time.
    pub fn describe(&self) -> String {
        format!(
            "{} ({}), {}",
            self.inner.label,
            self.current_state(),
            time_string(self.elapsed())
        )
    }

    /// The failure record, when the future has failed.
    pub fn failure(&self) -> Option<Failure> {
        if !self.is_failed() {
            return None;
        }
        self.inner.shared.lock().failure.clone()
    }

    /// The failure reason, when the future has failed.
    pub fn failure_reason(&self) -> Option<String> {
        self.failure().map(|failure| failure.reason().to_string())
    }

    /// The component that raised the failure, when the future has failed.
    pub fn failure_component(&self) -> Option<String> {
        self.failure().map(|failure| failure.component().to_string())
    }

    /// Marks this future as done with the given value.
    ///
    /// The first terminal transition wins; calling this on an already-ready
    /// future changes nothing.
    pub fn done(&self, value: T) -> Future<T> {
        self.apply_state(move |shared| shared.value = Some(value), State::Done)
    }

    /// Marks this future as failed with a reason string.
    pub fn fail(&self, reason: impl Into<String>) -> Future<T> {
        self.fail_with(Failure::from_reason(reason, UNKNOWN_COMPONENT))
    }

    /// Marks this future as failed, naming the component that raised it.
    pub fn fail_in(&self, reason: impl Into<String>, component: impl Into<String>) -> Future<T> {
        self.fail_with(Failure::from_reason(reason, component))
    }

    /// Marks this future as failed, capturing the error object so typed
    /// handlers can later recover it by downcasting. The reason string is the
    /// error's `Display` rendering.
    pub fn fail_error<E>(&self, error: E) -> Future<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.fail_with(Failure::from_error(Arc::new(error), UNKNOWN_COMPONENT))
    }

    /// Copies the failure record - reason, component and captured error -
    /// from another, already-failed future and fails this one with it.
    ///
    /// # Panics
    ///
    /// Panics if `other` is not in the failed state.
    pub fn fail_from<U: Send + 'static>(&self, other: &Future<U>) -> Future<T> {
        match other.failure() {
            Some(failure) => self.fail_with(failure),
            None => panic!("fail_from() source future is not failed"),
        }
    }

    pub(crate) fn fail_with(&self, failure: Failure) -> Future<T> {
        self.apply_state(move |shared| shared.failure = Some(failure), State::Failed)
    }

    /// Marks this future as cancelled. Cooperative: anything already running
    /// keeps running, but `on_done` handlers will never fire.
    pub fn cancel(&self) -> Future<T> {
        self.apply_state(|_| {}, State::Cancelled)
    }

    /// Adds a handler called with the future itself once it resolves,
    /// whatever the terminal state.
    pub fn on_ready<F>(&self, code: F) -> Future<T>
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        self.call_when_ready(code)
    }

    /// Adds a handler called with the failure reason if this future fails.
    pub fn on_fail<F>(&self, code: F) -> Future<T>
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.call_when_ready(move |f| {
            if let Some(failure) = f.failure() {
                code(failure.reason().to_string());
            }
        })
    }

    /// Adds a handler called only when this future fails *and* the captured
    /// error object downcasts to `E`. Failures carrying no error object, or
    /// one of a different type, are skipped.
    pub fn on_fail_typed<E, F>(&self, code: F) -> Future<T>
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(&E) + Send + 'static,
    {
        self.call_when_ready(move |f| {
            let Some(failure) = f.failure() else { return };
            if let Some(cause) = failure.downcast_ref::<E>() {
                code(cause);
            }
        })
    }

    /// Adds a handler called if this future is cancelled.
    pub fn on_cancel<F>(&self, code: F) -> Future<T>
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_when_ready(move |f| {
            if f.is_cancelled() {
                code();
            }
        })
    }

    /// Like [`on_cancel`](Future::on_cancel), but the handler receives the
    /// future itself.
    pub fn on_cancel_with<F>(&self, code: F) -> Future<T>
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        self.call_when_ready(move |f| {
            if f.is_cancelled() {
                code(f);
            }
        })
    }

    /// Queues `code` if this future is still pending, otherwise runs it
    /// immediately on the calling thread. The ready-or-queue decision is made
    /// under the lock, so a callback can never be both queued and missed by
    /// the draining transition.
    fn call_when_ready<F>(&self, code: F) -> Future<T>
    where
        F: FnOnce(&Future<T>) + Send + 'static,
    {
        let immediate = {
            let mut shared = self.inner.shared.lock();
            if self.inner.state.load(Ordering::Acquire) == State::Pending as u8 {
                shared.tasks.push(Box::new(code));
                None
            } else {
                Some(code)
            }
        };
        if let Some(code) = immediate {
            code(self);
        }
        self.clone()
    }

    /// Performs a terminal transition: store the outcome, freeze the clock,
    /// move the callback queue out, set the state, and only then - with the
    /// lock released - run the drained callbacks in registration order.
    ///
    /// A panicking callback is logged and does not stop the rest of the queue
    /// from draining.
    fn apply_state(&self, update: impl FnOnce(&mut Shared<T>), next: State) -> Future<T> {
        let drained = {
            let mut shared = self.inner.shared.lock();
            if self.inner.state.load(Ordering::Acquire) != State::Pending as u8 {
                None
            } else {
                update(&mut shared);
                shared.resolved_at = Some(Instant::now());
                let tasks = mem::take(&mut shared.tasks);
                // State write goes last: a lock-free reader that observes a
                // terminal state must also observe the stored outcome.
                self.inner.state.store(next as u8, Ordering::Release);
                Some(tasks)
            }
        };
        let Some(tasks) = drained else {
            trace!(
                target: "sequent::future",
                label = %self.inner.label,
                state = self.current_state(),
                "transition ignored, future already resolved"
            );
            return self.clone();
        };
        trace!(
            target: "sequent::future",
            label = %self.inner.label,
            state = next.name(),
            callbacks = tasks.len(),
            "future resolved"
        );
        for task in tasks {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task(self))) {
                error!(
                    target: "sequent::future",
                    label = %self.inner.label,
                    "callback panicked: {}",
                    panic_reason(payload.as_ref())
                );
            }
        }
        self.clone()
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// Returns the value if this future completed successfully, or the
    /// categorical error describing why it is unavailable: still pending,
    /// cancelled, or failed (with the failure record attached).
    pub fn value(&self) -> Result<T, FutureError> {
        match self.state() {
            State::Pending => Err(FutureError::IsPending),
            State::Cancelled => Err(FutureError::IsCancelled),
            State::Failed => {
                let failure = self
                    .inner
                    .shared
                    .lock()
                    .failure
                    .clone()
                    .unwrap_or_else(|| Failure::from_reason("unknown", UNKNOWN_COMPONENT));
                Err(FutureError::IsFailed(failure))
            }
            State::Done => Ok(self
                .inner
                .shared
                .lock()
                .value
                .clone()
                .expect("done future holds a value")),
        }
    }

    /// Adds a handler called with the value if this future completes
    /// successfully.
    pub fn on_done<F>(&self, code: F) -> Future<T>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.call_when_ready(move |f| {
            if let Ok(value) = f.value() {
                code(value);
            }
        })
    }

    /// Attaches this future to `target`, so that `target` is resolved with
    /// the same outcome - value, failure record, or cancellation - when this
    /// future resolves. Returns `target` for chaining.
    pub fn propagate(&self, target: &Future<T>) -> Future<T> {
        let target_handle = target.clone();
        self.on_ready(move |f| {
            if f.is_failed() {
                target_handle.fail_from(f);
            } else if f.is_cancelled() {
                target_handle.cancel();
            } else if let Ok(value) = f.value() {
                target_handle.done(value);
            }
        });
        target.clone()
    }

    /// Chains a computation onto this future, the monadic building block for
    /// composing deferred work.
    ///
    /// The returned *sequence future* resolves once the *inner* future
    /// produced by `ok` does. If this future fails, the failure is forwarded
    /// unchanged; if it is cancelled, the sequence future fails with
    /// `"cancelled"`. Cancelling the sequence future before this one resolves
    /// suppresses `ok` entirely, and cancelling it afterwards cancels the
    /// inner future.
    ///
    /// A panic inside `ok` fails the sequence future with the panic message,
    /// attributed to the `then callback` component.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use sequent_core::future::{Future, resolved_future};
    ///
    /// let f = Future::new();
    /// let g = f.then(|v: i32| resolved_future(format!("n={v}")));
    /// f.done(3);
    /// assert_eq!(g.value().unwrap(), "n=3");
    /// ```
    pub fn then<U, F>(&self, ok: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        self.then_else(ok, Vec::new())
    }

    /// Like [`then`](Future::then), with error branches.
    ///
    /// When this future fails, the branches are probed in order and the first
    /// one that matches the failure produces the inner future instead; see
    /// [`ErrorBranch`]. If none matches, the original failure is forwarded.
    pub fn then_else<U, F>(&self, ok: F, branches: Vec<ErrorBranch<U>>) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let sequence = Future::with_label("sequence future");
        let outer = sequence.clone();
        self.call_when_ready(move |f| {
            if outer.is_ready() {
                // The caller resolved the sequence future first (usually by
                // cancelling it); the handlers must not run.
                return;
            }
            if f.is_done() {
                let Ok(input) = f.value() else { return };
                match panic::catch_unwind(AssertUnwindSafe(move || ok(input))) {
                    Ok(inner) => forward(&inner, &outer),
                    Err(payload) => {
                        outer.fail_in(panic_reason(payload.as_ref()), "then callback");
                    }
                }
            } else if f.is_failed() {
                let Some(failure) = f.failure() else { return };
                for branch in branches {
                    match panic::catch_unwind(AssertUnwindSafe(|| branch.run(&failure))) {
                        Ok(Some(inner)) => {
                            forward(&inner, &outer);
                            return;
                        }
                        Ok(None) => {}
                        Err(payload) => {
                            outer.fail_in(panic_reason(payload.as_ref()), "error branch");
                            return;
                        }
                    }
                }
                outer.fail_with(failure);
            } else {
                outer.fail("cancelled");
            }
        });
        sequence
    }
}

/// Wires an inner future (returned by a `then` handler) to the outer
/// sequence future, in both directions: the inner outcome resolves the outer
/// future, and cancelling the outer future cancels the inner one. The
/// closures registered here hold the only cross-references between the two,
/// and are released when their futures drain their queues.
fn forward<U: Clone + Send + 'static>(inner: &Future<U>, outer: &Future<U>) {
    let target = outer.clone();
    inner.on_done(move |value| {
        target.done(value);
    });
    let target = outer.clone();
    let source = inner.clone();
    inner.on_fail(move |_| {
        target.fail_from(&source);
    });
    let target = outer.clone();
    inner.on_cancel(move || {
        target.fail("cancelled");
    });
    let chained = inner.clone();
    outer.on_cancel(move || {
        chained.cancel();
    });
}

/// One error branch of a [`then_else`](Future::then_else) call: a predicate
/// over the failure plus the handler to run when it matches.
pub struct ErrorBranch<U> {
    probe: Box<dyn FnOnce(&Failure) -> Option<Future<U>> + Send>,
}

impl<U: Send + 'static> ErrorBranch<U> {
    /// A branch that matches every failure; the handler receives the reason
    /// string.
    pub fn any<F>(handler: F) -> Self
    where
        F: FnOnce(String) -> Future<U> + Send + 'static,
    {
        ErrorBranch {
            probe: Box::new(move |failure| Some(handler(failure.reason().to_string()))),
        }
    }

    /// A branch that matches only failures whose captured error object
    /// downcasts to `E`.
    pub fn typed<E, F>(handler: F) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        F: FnOnce(&E) -> Future<U> + Send + 'static,
    {
        ErrorBranch {
            probe: Box::new(move |failure| failure.downcast_ref::<E>().map(handler)),
        }
    }

    fn run(self, failure: &Failure) -> Option<Future<U>> {
        (self.probe)(failure)
    }
}

impl<U> fmt::Debug for ErrorBranch<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBranch")
            .field("probe", &"<function>")
            .finish()
    }
}

/// Creates a new pending future with the default label.
pub fn make_future<T: Send + 'static>() -> Future<T> {
    Future::new()
}

/// Creates a future that is already done with the given value.
pub fn resolved_future<T: Send + 'static>(value: T) -> Future<T> {
    let f = Future::new();
    f.done(value)
}

/// Renders a panic payload as a string, for failure reasons and logs.
fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<unknown panic>".to_string()
    }
}

/// Humanises a duration the way `describe` reports it: the non-zero
/// components from days down to nanoseconds, concatenated.
fn time_string(elapsed: Duration) -> String {
    const UNITS: [(&str, u128); 7] = [
        ("d", 86_400_000_000_000),
        ("h", 3_600_000_000_000),
        ("m", 60_000_000_000),
        ("s", 1_000_000_000),
        ("ms", 1_000_000),
        ("\u{b5}s", 1_000),
        ("ns", 1),
    ];
    let mut remaining = elapsed.as_nanos();
    let mut out = String::new();
    for (suffix, size) in UNITS {
        let count = remaining / size;
        remaining %= size;
        if count != 0 {
            out.push_str(&format!("{count}{suffix}"));
        }
    }
    if out.is_empty() {
        out.push_str("0ns");
    }
    out
}
