// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cancellation-aware join over dispatched units of work.

use crate::context::Unit;
use crate::macros::{log_debug, log_warn};
use crate::CancelToken;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};

/// How a join over a batch of units resolved.
pub(crate) enum JoinOutcome<O> {
    /// All units reached a terminal state; their outputs are collected in
    /// completion order.
    Completed(Vec<O>),
    /// The cancellation token fired while waiting. Units that were handed to
    /// an execution context keep running in the background; their outputs are
    /// discarded.
    Cancelled,
}

/// Waits until either all units have completed or the token fires, whichever
/// comes first, without polling in a loop.
///
/// With a token that can never fire, this degenerates to a plain join. With a
/// token that already fired, this returns immediately and no unit is awaited
/// further.
pub(crate) async fn join_all<O>(
    mut units: FuturesUnordered<Unit<O>>,
    token: &CancelToken,
) -> JoinOutcome<O>
where
    O: Send + 'static,
{
    if token.is_cancelled() {
        abandon(units);
        return JoinOutcome::Cancelled;
    }

    let mut outputs = Vec::with_capacity(units.len());
    if !token.is_cancellable() {
        while let Some(output) = units.next().await {
            outputs.push(output);
        }
        return JoinOutcome::Completed(outputs);
    }

    // Race the join against the token. The token registration lives for the
    // whole wait and is released when this future is dropped.
    let mut cancelled = token.cancelled().fuse();
    let was_cancelled = loop {
        futures::select! {
            output = units.next() => match output {
                Some(output) => outputs.push(output),
                None => break false,
            },
            () = cancelled => break true,
        }
    };
    if was_cancelled {
        abandon(units);
        JoinOutcome::Cancelled
    } else {
        JoinOutcome::Completed(outputs)
    }
}

/// Stops waiting on the given units. Units running on an execution context
/// are disassociated from their handles and complete in the background.
fn abandon<O>(units: FuturesUnordered<Unit<O>>) {
    if !units.is_empty() {
        log_warn!(
            "Abandoning {} unit(s) of work after cancellation.",
            units.len()
        );
    }
    drop(units);
    log_debug!("Join resolved as cancelled.");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::context::Dispatcher;
    use futures::executor::block_on;
    use std::time::Duration;

    fn inline_units<O: Send + 'static>(
        work: impl IntoIterator<Item = futures::future::BoxFuture<'static, O>>,
    ) -> FuturesUnordered<Unit<O>> {
        let dispatcher = Dispatcher::new(None);
        work.into_iter()
            .map(|future| dispatcher.submit(future).unwrap())
            .collect()
    }

    #[test]
    fn plain_join_with_a_never_token() {
        let units = inline_units((0..5).map(|i| async move { i }.boxed()));
        match block_on(join_all(units, &CancelToken::never())) {
            JoinOutcome::Completed(mut outputs) => {
                outputs.sort();
                assert_eq!(outputs, vec![0, 1, 2, 3, 4]);
            }
            JoinOutcome::Cancelled => panic!("the join can't be cancelled"),
        }
    }

    #[test]
    fn pre_cancelled_token_resolves_without_waiting() {
        let token = CancelToken::new();
        token.cancel();
        // A unit that would never complete: the join must not await it.
        let units = inline_units([futures::future::pending::<()>().boxed()]);
        assert!(matches!(
            block_on(join_all(units, &token)),
            JoinOutcome::Cancelled
        ));
    }

    #[test]
    fn cancellation_during_the_wait_resolves_the_join() {
        let token = CancelToken::new();
        let units = inline_units([futures::future::pending::<()>().boxed()]);

        let clone = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            clone.cancel();
        });
        assert!(matches!(
            block_on(join_all(units, &token)),
            JoinOutcome::Cancelled
        ));
        handle.join().unwrap();
    }

    #[test]
    fn completed_join_with_a_cancellable_token() {
        let token = CancelToken::new();
        let units = inline_units((0..5).map(|i| async move { i }.boxed()));
        match block_on(join_all(units, &token)) {
            JoinOutcome::Completed(mut outputs) => {
                outputs.sort();
                assert_eq!(outputs, vec![0, 1, 2, 3, 4]);
            }
            JoinOutcome::Cancelled => panic!("the token never fired"),
        }
    }
}
