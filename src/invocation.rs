// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-item invocation unit.

use crate::CancelToken;
use std::future::Future;

/// Couples one item with its original position and the run's cancellation
/// token, ready to be invoked exactly once.
pub(crate) struct Invocation<T> {
    /// Item to pass to the operation.
    item: T,
    /// Position of the item in the original sequence.
    index: usize,
    /// Cancellation token of the run.
    token: CancelToken,
}

/// Terminal state of a single invocation.
pub(crate) enum Completion<R, E> {
    /// The operation completed and produced a result.
    Done(R),
    /// The operation returned an error.
    Fault(E),
    /// The cancellation token fired before the operation was invoked; the
    /// operation wasn't called for this item.
    Skipped,
}

impl<T> Invocation<T> {
    /// Creates the invocation unit for one item.
    pub(crate) fn new(item: T, index: usize, token: CancelToken) -> Self {
        Self { item, index, token }
    }

    /// Invokes the operation on this unit's item, checking the cancellation
    /// token first.
    ///
    /// The operation receives the item, its original index, and a clone of
    /// the token so that it can observe cancellation at its own suspension
    /// points.
    pub(crate) async fn run<F, Fut, R, E>(self, operation: &F) -> Completion<R, E>
    where
        F: Fn(T, usize, CancelToken) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if self.token.is_cancelled() {
            return Completion::Skipped;
        }
        match operation(self.item, self.index, self.token).await {
            Ok(result) => Completion::Done(result),
            Err(error) => Completion::Fault(error),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn invocation_passes_item_and_index() {
        let token = CancelToken::never();
        let completion = block_on(
            Invocation::new(21u64, 7, token)
                .run(&|item, index, _| async move { Ok::<_, String>(item * index as u64) }),
        );
        assert!(matches!(completion, Completion::Done(147)));
    }

    #[test]
    fn fault_is_propagated_verbatim() {
        let token = CancelToken::never();
        let completion = block_on(
            Invocation::new(21u64, 0, token)
                .run(&|_, _, _| async move { Err::<u64, _>("boom".to_owned()) }),
        );
        match completion {
            Completion::Fault(error) => assert_eq!(error, "boom"),
            _ => panic!("expected a fault"),
        }
    }

    #[test]
    fn cancelled_token_skips_the_operation() {
        let token = CancelToken::new();
        token.cancel();
        let completion = block_on(
            Invocation::new(21u64, 0, token)
                .run(&|_, _, _| async move { Ok::<u64, String>(unreachable!()) }),
        );
        assert!(matches!(completion, Completion::Skipped));
    }
}
