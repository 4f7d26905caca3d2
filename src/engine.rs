// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The iteration engine: strategy selection, the serial and partitioned
//! execution paths, and result assembly.

use crate::context::Dispatcher;
use crate::invocation::{Completion, Invocation};
use crate::join::{join_all, JoinOutcome};
use crate::macros::log_debug;
use crate::source::{self, Partition};
use crate::stream::{serial_stream, IterationStream};
use crate::{CancelToken, IterationError};
use futures::channel::mpsc;
use futures::stream::FuturesUnordered;
use futures::task::Spawn;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Concurrency policy of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// One concurrent invocation per item, with no cap.
    Unbounded,
    /// One invocation at a time, each awaited before the next one starts.
    Serial,
    /// At most the given number of concurrent invocations. The input is split
    /// into that many contiguous partitions, each drained sequentially by one
    /// worker.
    Bounded(NonZeroUsize),
}

impl Parallelism {
    /// Maps an integer degree of parallelism to a policy, following the usual
    /// sentinel convention: `0` is unbounded and `1` is serial.
    ///
    /// ```rust
    /// # use paraloop::Parallelism;
    /// assert_eq!(Parallelism::from_degree(0), Parallelism::Unbounded);
    /// assert_eq!(Parallelism::from_degree(1), Parallelism::Serial);
    /// assert_eq!(Parallelism::from_degree(4).degree(), 4);
    /// ```
    pub fn from_degree(degree: usize) -> Self {
        match degree {
            0 => Parallelism::Unbounded,
            1 => Parallelism::Serial,
            degree => Parallelism::Bounded(NonZeroUsize::new(degree).unwrap()),
        }
    }

    /// Returns the integer degree of parallelism for this policy: `0` for
    /// unbounded, `1` for serial, and the worker count otherwise.
    pub fn degree(&self) -> usize {
        match self {
            Parallelism::Unbounded => 0,
            Parallelism::Serial => 1,
            Parallelism::Bounded(workers) => workers.get(),
        }
    }
}

impl Default for Parallelism {
    /// Defaults to [`Parallelism::Unbounded`].
    fn default() -> Self {
        Parallelism::Unbounded
    }
}

/// A builder to configure and run one iteration.
///
/// The operation receives each item by value together with its original
/// index and a clone of the cancellation token; it returns a future
/// resolving to a [`Result`]. Arguments that an operation doesn't need are
/// simply ignored with `_`.
///
/// ```rust
/// # use paraloop::{IterationBuilder, Parallelism};
/// # use std::convert::Infallible;
/// let squares = futures::executor::block_on(
///     IterationBuilder::new(Parallelism::Unbounded).collect(
///         [1u64, 2, 3, 4],
///         |item, _, _| async move { Ok::<u64, Infallible>(item * item) },
///     ),
/// )
/// .unwrap();
/// assert_eq!(squares, vec![1, 4, 9, 16]);
/// ```
#[must_use = "an iteration builder does nothing until one of its run methods is called"]
pub struct IterationBuilder<'context> {
    /// Concurrency policy.
    parallelism: Parallelism,
    /// Execution context to dispatch units of work onto, if any.
    context: Option<&'context dyn Spawn>,
    /// Cancellation token observed by the run.
    token: CancelToken,
}

impl IterationBuilder<'static> {
    /// Creates a builder for the given concurrency policy, with no execution
    /// context and a token that never fires.
    pub fn new(parallelism: Parallelism) -> Self {
        Self {
            parallelism,
            context: None,
            token: CancelToken::never(),
        }
    }
}

impl Default for IterationBuilder<'static> {
    /// Defaults to an unbounded concurrent run with no execution context and
    /// a token that never fires.
    fn default() -> Self {
        Self::new(Parallelism::default())
    }
}

impl<'context> IterationBuilder<'context> {
    /// Dispatches all units of work of this run onto the given execution
    /// context, instead of polling them within the caller's task.
    ///
    /// Each unit runs as a detached task: no unrelated parent scope can
    /// cancel it, and a unit abandoned after cancellation runs to completion
    /// on the context. Under the serial policy, the whole run is queued to
    /// the context as a single unit of work.
    pub fn with_context<'a>(self, context: &'a dyn Spawn) -> IterationBuilder<'a> {
        IterationBuilder {
            parallelism: self.parallelism,
            context: Some(context),
            token: self.token,
        }
    }

    /// Makes the run observe the given cancellation token.
    ///
    /// The token is checked once per item before invoking the operation, and
    /// while waiting for in-flight invocations at the end of the run.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.token = token;
        self
    }

    /// Runs the operation on every item, discarding results.
    ///
    /// All items are visited exactly once, unless the run is cancelled or an
    /// invocation faults. The first fault (by item index) is surfaced once
    /// all in-flight invocations have reached a terminal state; in-flight
    /// invocations are never retracted by a sibling's fault.
    pub async fn for_each<T, I, F, Fut, E>(
        self,
        items: I,
        operation: F,
    ) -> Result<(), IterationError<E>>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T, usize, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        self.collect(items, operation).await.map(|_| ())
    }

    /// Runs the operation on every item and collects the results in input
    /// order.
    ///
    /// Slot `i` of the returned vector holds the result for the item at
    /// position `i` of the input, regardless of the policy and of completion
    /// order. On fault or cancellation no partial results are exposed.
    pub async fn collect<T, I, F, Fut, R, E>(
        self,
        items: I,
        operation: F,
    ) -> Result<Vec<R>, IterationError<E>>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T, usize, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let Self {
            parallelism,
            context,
            token,
        } = self;
        let dispatcher = Dispatcher::new(context);

        // A token cancelled before the call invokes nothing and doesn't even
        // enumerate the input.
        if token.is_cancelled() {
            log_debug!("Token already cancelled, skipping the run.");
            return Err(IterationError::Cancelled);
        }

        let items = source::materialize(items);
        let num_items = items.len();
        if num_items == 0 {
            return Ok(Vec::new());
        }

        match (parallelism, dispatcher.is_inline()) {
            (Parallelism::Serial, true) => {
                log_debug!("Running {num_items} item(s) serially, inline.");
                run_serial(items, operation, token).await
            }
            (Parallelism::Serial, false) => {
                log_debug!("Running {num_items} item(s) serially, as one unit on the context.");
                run_partitioned(items, 1, operation, token, &dispatcher).await
            }
            (Parallelism::Unbounded, _) => {
                log_debug!("Running {num_items} item(s) with unbounded concurrency.");
                run_partitioned(items, num_items, operation, token, &dispatcher).await
            }
            (Parallelism::Bounded(workers), _) => {
                log_debug!(
                    "Running {num_items} item(s) on {} bounded worker(s).",
                    workers.get()
                );
                run_partitioned(items, workers.get(), operation, token, &dispatcher).await
            }
        }
    }

    /// Runs the operation on every item and returns the results as a lazy,
    /// non-restartable stream.
    ///
    /// Each result is tagged with the original index of its item. Under
    /// concurrent policies results are yielded in completion order; under the
    /// serial inline policy this coincides with input order. An invocation
    /// fault is yielded inline and only stops the partition that produced it;
    /// a cancellation is yielded once as a terminal
    /// [`IterationError::Cancelled`] item.
    pub fn stream<T, I, F, Fut, R, E>(self, items: I, operation: F) -> IterationStream<R, E>
    where
        I: IntoIterator<Item = T>,
        F: Fn(T, usize, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        T: Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
    {
        let Self {
            parallelism,
            context,
            token,
        } = self;
        let dispatcher = Dispatcher::new(context);

        if token.is_cancelled() {
            log_debug!("Token already cancelled, skipping the streaming run.");
            return IterationStream::failed(IterationError::Cancelled);
        }

        let items = source::materialize(items);
        let num_items = items.len();
        if num_items == 0 {
            return IterationStream::empty();
        }

        let num_workers = match (parallelism, dispatcher.is_inline()) {
            (Parallelism::Serial, true) => {
                log_debug!("Streaming {num_items} item(s) serially, inline.");
                return IterationStream::direct(serial_stream(items, operation, token));
            }
            (Parallelism::Serial, false) => 1,
            (Parallelism::Unbounded, _) => num_items,
            (Parallelism::Bounded(workers), _) => workers.get(),
        };
        log_debug!("Streaming {num_items} item(s) on {num_workers} worker(s).");

        let (results, receiver) = mpsc::unbounded();
        let operation = Arc::new(operation);
        let workers = FuturesUnordered::new();
        for partition in source::split(items, num_workers) {
            let unit = dispatcher.submit(stream_partition(
                partition,
                operation.clone(),
                token.clone(),
                results.clone(),
            ));
            match unit {
                Ok(unit) => workers.push(unit),
                Err(error) => return IterationStream::failed(error.into()),
            }
        }
        // Only the workers hold senders: the stream ends once all of them
        // completed and the queue is drained.
        drop(results);
        IterationStream::queued(receiver, workers, &token)
    }
}

/// Runs all invocations one at a time, in input order, within the caller's
/// task. Stops at the first fault or at the first cancellation check that
/// fires.
async fn run_serial<T, F, Fut, R, E>(
    items: Vec<T>,
    operation: F,
    token: CancelToken,
) -> Result<Vec<R>, IterationError<E>>
where
    F: Fn(T, usize, CancelToken) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut results = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match Invocation::new(item, index, token.clone())
            .run(&operation)
            .await
        {
            Completion::Done(result) => results.push(result),
            Completion::Fault(source) => return Err(IterationError::Operation { index, source }),
            Completion::Skipped => return Err(IterationError::Cancelled),
        }
    }
    Ok(results)
}

/// Splits the items into one contiguous partition per worker, dispatches the
/// workers, and joins them under the cancellation token.
async fn run_partitioned<T, F, Fut, R, E>(
    items: Vec<T>,
    num_workers: usize,
    operation: F,
    token: CancelToken,
    dispatcher: &Dispatcher<'_>,
) -> Result<Vec<R>, IterationError<E>>
where
    F: Fn(T, usize, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    let num_items = items.len();
    let operation = Arc::new(operation);
    let units = FuturesUnordered::new();
    for partition in source::split(items, num_workers) {
        units.push(dispatcher.submit(drain_partition(
            partition,
            operation.clone(),
            token.clone(),
        ))?);
    }

    match join_all(units, &token).await {
        JoinOutcome::Cancelled => Err(IterationError::Cancelled),
        JoinOutcome::Completed(reports) => assemble(num_items, reports),
    }
}

/// What one worker observed while draining its partition.
struct WorkerReport<R, E> {
    /// Results produced so far, paired with their original indices.
    results: Vec<(usize, R)>,
    /// First fault hit by this worker, if any. The worker stops draining its
    /// partition once an invocation faults.
    fault: Option<(usize, E)>,
    /// Whether this worker stopped early because the token fired.
    interrupted: bool,
}

/// Drains one partition sequentially: at most one invocation of this worker
/// is in flight at any instant.
async fn drain_partition<T, F, Fut, R, E>(
    partition: Partition<T>,
    operation: Arc<F>,
    token: CancelToken,
) -> WorkerReport<R, E>
where
    F: Fn(T, usize, CancelToken) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let mut report = WorkerReport {
        results: Vec::with_capacity(partition.len()),
        fault: None,
        interrupted: false,
    };
    for (index, item) in partition {
        match Invocation::new(item, index, token.clone())
            .run(operation.as_ref())
            .await
        {
            Completion::Done(result) => report.results.push((index, result)),
            Completion::Fault(error) => {
                report.fault = Some((index, error));
                break;
            }
            Completion::Skipped => {
                report.interrupted = true;
                break;
            }
        }
    }
    report
}

/// Drains one partition sequentially, forwarding each result to the stream's
/// queue as soon as it is produced. Stops early if the consumer is gone.
async fn stream_partition<T, F, Fut, R, E>(
    partition: Partition<T>,
    operation: Arc<F>,
    token: CancelToken,
    results: mpsc::UnboundedSender<(usize, Result<R, E>)>,
) where
    F: Fn(T, usize, CancelToken) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    for (index, item) in partition {
        match Invocation::new(item, index, token.clone())
            .run(operation.as_ref())
            .await
        {
            Completion::Done(result) => {
                if results.unbounded_send((index, Ok(result))).is_err() {
                    return;
                }
            }
            Completion::Fault(error) => {
                let _ = results.unbounded_send((index, Err(error)));
                return;
            }
            Completion::Skipped => return,
        }
    }
}

/// Merges the worker reports into the ordered result vector.
///
/// Worker partitions are disjoint by construction, so each slot is written
/// exactly once. If any worker faulted, the fault with the smallest item
/// index wins; otherwise, if any worker was interrupted by the token, the
/// run resolves as cancelled.
fn assemble<R, E>(
    num_items: usize,
    reports: Vec<WorkerReport<R, E>>,
) -> Result<Vec<R>, IterationError<E>> {
    let mut slots: Vec<Option<R>> = Vec::with_capacity(num_items);
    slots.resize_with(num_items, || None);
    let mut first_fault: Option<(usize, E)> = None;
    let mut interrupted = false;

    for report in reports {
        for (index, result) in report.results {
            debug_assert!(slots[index].is_none(), "index {index} was written twice");
            slots[index] = Some(result);
        }
        if let Some((index, error)) = report.fault {
            match &first_fault {
                Some((first_index, _)) if *first_index <= index => (),
                _ => first_fault = Some((index, error)),
            }
        }
        interrupted |= report.interrupted;
    }

    if let Some((index, source)) = first_fault {
        return Err(IterationError::Operation { index, source });
    }
    if interrupted {
        return Err(IterationError::Cancelled);
    }
    Ok(slots
        .into_iter()
        .map(|slot| slot.expect("a completed join left an unwritten slot"))
        .collect())
}
