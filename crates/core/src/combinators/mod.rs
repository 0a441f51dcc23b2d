use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::future::{Future, resolved_future};


/// An aggregate future that completes with `0` once every input has
/// completed successfully.
///
/// An empty input list completes immediately. The first input to fail hands
/// its failure record to the aggregate; the first input to be cancelled fails
/// the aggregate with `"input cancelled"`. Either way the remaining inputs
/// are left untouched - callers may still have their own handlers on them -
/// and their later resolutions are observed and discarded.
///
/// # Examples
///
/// ```rust
/// use sequent_core::combinators::needs_all;
/// use sequent_core::future::Future;
///
/// let first: Future<i32> = Future::new();
/// let second: Future<i32> = Future::new();
/// let all = needs_all(&[first.clone(), second.clone()]);
///
/// first.done(1);
/// assert!(all.is_pending());
/// second.done(2);
/// assert!(all.is_done());
/// ```
pub fn needs_all<T: Send + 'static>(inputs: &[Future<T>]) -> Future<i32> {
    let aggregate = Future::with_label("needs_all");
    if inputs.is_empty() {
        return aggregate.done(0);
    }
    let remaining = Arc::new(AtomicUsize::new(inputs.len()));
    for input in inputs {
        let aggregate = aggregate.clone();
        let remaining = Arc::clone(&remaining);
        input.on_ready(move |input| {
            if aggregate.is_ready() {
                return;
            }
            if input.is_failed() {
                trace!(
                    target: "sequent::combinators",
                    input = %input.label(),
                    "needs_all failing, input failed"
                );
                aggregate.fail_from(input);
                return;
            }
            if input.is_cancelled() {
                trace!(
                    target: "sequent::combinators",
                    input = %input.label(),
                    "needs_all failing, input cancelled"
                );
                aggregate.fail("input cancelled");
                return;
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                trace!(target: "sequent::combinators", "needs_all complete, every input done");
                aggregate.done(0);
            }
        });
    }
    aggregate
}

/// An aggregate future that completes with `0` as soon as any input
/// completes successfully.
///
/// An empty input list fails immediately with `"no elements"`. The aggregate
/// fails only once every input has failed or been cancelled: the last
/// resolution decides the failure record.
pub fn needs_any<T: Send + 'static>(inputs: &[Future<T>]) -> Future<i32> {
    let aggregate = Future::with_label("needs_any");
    if inputs.is_empty() {
        return aggregate.fail("no elements");
    }
    let remaining = Arc::new(AtomicUsize::new(inputs.len()));
    for input in inputs {
        let aggregate = aggregate.clone();
        let remaining = Arc::clone(&remaining);
        input.on_ready(move |input| {
            if aggregate.is_ready() {
                return;
            }
            if input.is_done() {
                trace!(
                    target: "sequent::combinators",
                    input = %input.label(),
                    "needs_any complete, input done"
                );
                aggregate.done(0);
                return;
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                trace!(target: "sequent::combinators", "needs_any failing, no input succeeded");
                if input.is_failed() {
                    aggregate.fail_from(input);
                } else {
                    aggregate.fail("cancelled");
                }
            }
        });
    }
    aggregate
}

/// The check and body closures of a [`repeat`] loop, shared between
/// iterations.
struct Step<C, B> {
    check: C,
    body: B,
}

/// A continuation-style loop: runs `body` while `check` returns false,
/// completing the returned future with the last iteration's value once
/// `check` returns true.
///
/// `check` and `body` receive the previous iteration's completed future,
/// seeded with a trivially-completed `T::default()`. A failed or cancelled
/// iteration fails the loop. Iterations whose futures are already complete
/// are consumed inline, so a long synchronous loop does not grow the stack;
/// a pending iteration re-arms the loop from whichever thread resolves it.
/// Cancelling the returned future stops the loop and cancels the iteration
/// in flight.
///
/// # Examples
///
/// ```rust
/// use sequent_core::combinators::repeat;
/// use sequent_core::future::{Future, resolved_future};
///
/// let f = repeat(
///     |prev: &Future<i32>| prev.value().unwrap() >= 3,
///     |prev| resolved_future(prev.value().unwrap() + 1),
/// );
/// assert_eq!(f.value().unwrap(), 3);
/// ```
pub fn repeat<T, C, B>(check: C, body: B) -> Future<T>
where
    T: Clone + Default + Send + 'static,
    C: FnMut(&Future<T>) -> bool + Send + 'static,
    B: FnMut(&Future<T>) -> Future<T> + Send + 'static,
{
    let outer = Future::with_label("repeat");
    let step = Arc::new(Mutex::new(Step { check, body }));
    advance(outer.clone(), step, resolved_future(T::default()));
    outer
}

fn advance<T, C, B>(outer: Future<T>, step: Arc<Mutex<Step<C, B>>>, mut prev: Future<T>)
where
    T: Clone + Default + Send + 'static,
    C: FnMut(&Future<T>) -> bool + Send + 'static,
    B: FnMut(&Future<T>) -> Future<T> + Send + 'static,
{
    loop {
        if outer.is_ready() {
            return;
        }
        if prev.is_failed() {
            trace!(target: "sequent::combinators", "repeat failing, iteration failed");
            outer.fail_from(&prev);
            return;
        }
        if prev.is_cancelled() {
            trace!(target: "sequent::combinators", "repeat failing, iteration cancelled");
            outer.fail("cancelled");
            return;
        }
        let finished = {
            let mut step = step.lock();
            (step.check)(&prev)
        };
        if finished {
            trace!(target: "sequent::combinators", "repeat complete");
            prev.propagate(&outer);
            return;
        }
        let next = {
            let mut step = step.lock();
            (step.body)(&prev)
        };
        if next.is_pending() {
            // Cancelling the loop must reach the iteration in flight, the
            // same way a sequence future cancels its inner future.
            let iteration = next.clone();
            outer.on_cancel(move || {
                iteration.cancel();
            });
            let outer = outer.clone();
            let step = Arc::clone(&step);
            next.on_ready(move |resolved| advance(outer, step, resolved.clone()));
            return;
        }
        prev = next;
    }
}
