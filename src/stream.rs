// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Streaming delivery of per-item results.

use crate::cancel::Cancelled;
use crate::context::Unit;
use crate::invocation::{Completion, Invocation};
use crate::{CancelToken, IterationError};
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, FuturesUnordered};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// One element of an [`IterationStream`]: a result tagged with the original
/// index of its item, or a terminal error.
pub type StreamItem<R, E> = Result<(usize, R), IterationError<E>>;

/// A finite, non-restartable stream of per-item results, returned by
/// [`IterationBuilder::stream()`](crate::IterationBuilder::stream).
///
/// Under concurrent policies, results are yielded in completion order; the
/// original input position of each result is carried alongside it. A fault
/// only ends the partition that produced it, while a cancellation ends the
/// whole stream after yielding a single
/// [`IterationError::Cancelled`] element.
#[must_use = "streams do nothing unless polled"]
pub struct IterationStream<R, E> {
    /// Backing implementation.
    inner: Inner<R, E>,
}

/// Backing implementation of an [`IterationStream`].
enum Inner<R, E> {
    /// Results produced one by one, directly by the stream itself.
    Direct(BoxStream<'static, StreamItem<R, E>>),
    /// Results produced by concurrent workers and forwarded through a queue.
    Queued(QueuedResults<R, E>),
}

impl<R, E> IterationStream<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    /// A stream over the results of a run that produces them one at a time.
    pub(crate) fn direct(results: BoxStream<'static, StreamItem<R, E>>) -> Self {
        Self {
            inner: Inner::Direct(results),
        }
    }

    /// A stream over the queued results of concurrently dispatched workers.
    pub(crate) fn queued(
        results: mpsc::UnboundedReceiver<(usize, Result<R, E>)>,
        workers: FuturesUnordered<Unit<()>>,
        token: &CancelToken,
    ) -> Self {
        Self {
            inner: Inner::Queued(QueuedResults {
                results,
                workers,
                cancelled: token.cancelled(),
                done: false,
            }),
        }
    }

    /// A stream over a run that terminated before invoking anything.
    pub(crate) fn failed(error: IterationError<E>) -> Self {
        Self::direct(stream::once(futures::future::ready(Err(error))).boxed())
    }

    /// A stream over an empty input.
    pub(crate) fn empty() -> Self {
        Self::direct(stream::empty().boxed())
    }
}

impl<R, E> Stream for IterationStream<R, E>
where
    R: Send + 'static,
    E: Send + 'static,
{
    type Item = StreamItem<R, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().inner {
            Inner::Direct(results) => results.as_mut().poll_next(cx),
            Inner::Queued(queued) => queued.poll_next(cx),
        }
    }
}

/// Queue-backed delivery: workers forward each result as soon as it is
/// produced, and the stream drains the queue while also driving inline
/// workers and watching the cancellation token.
struct QueuedResults<R, E> {
    /// Receiving end of the result queue. It ends once all workers have
    /// completed and every forwarded result has been delivered.
    results: mpsc::UnboundedReceiver<(usize, Result<R, E>)>,
    /// The dispatched workers. Inline workers only make progress while the
    /// stream is polled; remote workers progress on their execution context.
    workers: FuturesUnordered<Unit<()>>,
    /// Resolves when the run's token is cancelled.
    cancelled: Cancelled,
    /// Whether the stream has terminated.
    done: bool,
}

impl<R, E> QueuedResults<R, E> {
    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<StreamItem<R, E>>> {
        if self.done {
            return Poll::Ready(None);
        }

        // A cancellation ends the stream immediately; queued results are
        // discarded and remote workers keep running in the background.
        if Pin::new(&mut self.cancelled).poll(cx).is_ready() {
            self.done = true;
            self.workers.clear();
            return Poll::Ready(Some(Err(IterationError::Cancelled)));
        }

        // Drive the workers as far as possible; their results arrive through
        // the queue.
        while let Poll::Ready(Some(())) = Pin::new(&mut self.workers).poll_next(cx) {}

        match Pin::new(&mut self.results).poll_next(cx) {
            Poll::Ready(Some((index, Ok(result)))) => Poll::Ready(Some(Ok((index, result)))),
            Poll::Ready(Some((index, Err(source)))) => {
                Poll::Ready(Some(Err(IterationError::Operation { index, source })))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Serial inline streaming: the next item is invoked only when the stream is
/// polled for it, so results come out strictly in input order.
///
/// A fault or an observed cancellation yields one terminal error element and
/// ends the stream.
pub(crate) fn serial_stream<T, F, Fut, R, E>(
    items: Vec<T>,
    operation: F,
    token: CancelToken,
) -> BoxStream<'static, StreamItem<R, E>>
where
    F: Fn(T, usize, CancelToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// State threaded through the unfolding.
    struct State<T, F> {
        /// Remaining items, paired with their original indices.
        items: std::iter::Enumerate<std::vec::IntoIter<T>>,
        /// The user operation.
        operation: F,
        /// Cancellation token of the run.
        token: CancelToken,
        /// Whether the stream already yielded a terminal error.
        live: bool,
    }

    stream::unfold(
        State {
            items: items.into_iter().enumerate(),
            operation,
            token,
            live: true,
        },
        |mut state| async move {
            if !state.live {
                return None;
            }
            let (index, item) = state.items.next()?;
            match Invocation::new(item, index, state.token.clone())
                .run(&state.operation)
                .await
            {
                Completion::Done(result) => Some((Ok((index, result)), state)),
                Completion::Fault(source) => {
                    state.live = false;
                    Some((Err(IterationError::Operation { index, source }), state))
                }
                Completion::Skipped => {
                    state.live = false;
                    Some((Err(IterationError::Cancelled), state))
                }
            }
        },
    )
    .boxed()
}
