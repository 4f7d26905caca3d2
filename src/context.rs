// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Dispatching units of work onto an optional execution context.
//!
//! The engine never owns a thread pool. Units of work are either polled
//! inline, within the task that awaits the iteration, or handed to a
//! caller-supplied [`Spawn`] implementation where they run as independent,
//! detached tasks.

use crate::macros::log_error;
use futures::future::{BoxFuture, FutureExt, RemoteHandle};
use futures::task::{Spawn, SpawnError, SpawnExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Routes units of work onto the caller-supplied execution context, or keeps
/// them inline when there is none.
pub(crate) struct Dispatcher<'context> {
    /// Execution context to hand units of work to, if any.
    context: Option<&'context dyn Spawn>,
}

impl<'context> Dispatcher<'context> {
    /// Creates a dispatcher targeting the given context, or the caller's own
    /// task if there is none.
    pub(crate) fn new(context: Option<&'context dyn Spawn>) -> Self {
        Self { context }
    }

    /// Returns whether units are polled inline rather than handed to an
    /// execution context.
    pub(crate) fn is_inline(&self) -> bool {
        self.context.is_none()
    }

    /// Wraps the given work into a [`Unit`].
    ///
    /// With an execution context, the work starts running on the context as
    /// soon as it is submitted, as a detached task that no unrelated parent
    /// scope can cancel. Otherwise the work runs lazily, whenever the
    /// returned [`Unit`] is polled.
    pub(crate) fn submit<O>(
        &self,
        work: impl Future<Output = O> + Send + 'static,
    ) -> Result<Unit<O>, SpawnError>
    where
        O: Send + 'static,
    {
        match self.context {
            None => Ok(Unit::Inline(work.boxed())),
            Some(context) => match context.spawn_with_handle(work) {
                Ok(handle) => Ok(Unit::Remote(Some(handle))),
                Err(_e) => {
                    log_error!("The execution context rejected a unit of work: {_e}");
                    Err(_e)
                }
            },
        }
    }
}

/// A dispatched unit of work, resolving to the work's output.
///
/// Dropping a remote unit disassociates it from the task running on the
/// execution context, which keeps running to completion: the engine can stop
/// waiting on in-flight work without retracting it.
pub(crate) enum Unit<O> {
    /// Work polled inline by whoever awaits this unit.
    Inline(BoxFuture<'static, O>),
    /// Handle to work running on the execution context. [`None`] once the
    /// output has been delivered.
    Remote(Option<RemoteHandle<O>>),
}

impl<O: Send + 'static> Future for Unit<O> {
    type Output = O;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<O> {
        match self.get_mut() {
            Unit::Inline(work) => work.as_mut().poll(cx),
            Unit::Remote(slot) => {
                let handle = slot.as_mut().expect("unit polled after completion");
                match Pin::new(handle).poll(cx) {
                    Poll::Ready(output) => {
                        *slot = None;
                        Poll::Ready(output)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<O> Drop for Unit<O> {
    /// Lets an undelivered remote task run to completion in the background.
    fn drop(&mut self) {
        if let Unit::Remote(slot) = self {
            if let Some(handle) = slot.take() {
                handle.forget();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::executor::{block_on, ThreadPool};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn inline_unit_runs_when_polled() {
        let dispatcher = Dispatcher::new(None);
        let unit = dispatcher.submit(async { 42 }).unwrap();
        assert!(matches!(unit, Unit::Inline(_)));
        assert_eq!(block_on(unit), 42);
    }

    #[test]
    fn remote_unit_runs_on_the_context() {
        let pool = ThreadPool::builder().pool_size(1).create().unwrap();
        let dispatcher = Dispatcher::new(Some(&pool));
        let unit = dispatcher
            .submit(async { std::thread::current().id() })
            .unwrap();
        assert!(matches!(unit, Unit::Remote(_)));
        assert_ne!(block_on(unit), std::thread::current().id());
    }

    #[test]
    fn dropped_remote_unit_runs_to_completion() {
        let pool = ThreadPool::builder().pool_size(1).create().unwrap();
        let dispatcher = Dispatcher::new(Some(&pool));

        let latch = crate::CancelToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let unit = {
            let latch = latch.clone();
            let counter = counter.clone();
            dispatcher
                .submit(async move {
                    latch.cancelled().await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };
        // Abandon the unit before the work is allowed to make progress.
        drop(unit);
        latch.cancel();

        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 1 {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("the abandoned unit of work never completed");
    }
}
