// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Terminal outcomes of an iteration that didn't complete.

use futures::task::SpawnError;
use thiserror::Error;

/// Error returned when an iteration doesn't run to completion.
///
/// Cancellation is deliberately a separate variant rather than a fault, so
/// that callers can branch on whether a run was merely cancelled.
#[derive(Debug, Error)]
pub enum IterationError<E> {
    /// The cancellation token fired before or during the run.
    ///
    /// No invocation is ever preempted: invocations that were already running
    /// when the token fired have reached a suspension point or completed, but
    /// their results are not exposed.
    #[error("the iteration was cancelled")]
    Cancelled,
    /// The operation returned an error for one of the items.
    ///
    /// When several invocations fail in the same run, the error with the
    /// smallest item index is surfaced, after all in-flight invocations have
    /// reached a terminal state.
    #[error("the operation failed on the item at index {index}")]
    Operation {
        /// Original position of the item whose invocation failed.
        index: usize,
        /// Error returned by the operation.
        #[source]
        source: E,
    },
    /// The execution context refused a unit of work, e.g. because it was shut
    /// down.
    #[error("the execution context rejected a unit of work")]
    Scheduler(#[from] SpawnError),
}

impl<E> IterationError<E> {
    /// Returns whether this outcome is a cancellation, as opposed to a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IterationError::Cancelled)
    }

    /// Returns the index and error of the failed invocation, if this outcome
    /// is an operation fault.
    pub fn operation(&self) -> Option<(usize, &E)> {
        match self {
            IterationError::Operation { index, source } => Some((*index, source)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cancellation_is_not_a_fault() {
        let error: IterationError<String> = IterationError::Cancelled;
        assert!(error.is_cancelled());
        assert!(error.operation().is_none());

        let error: IterationError<String> = IterationError::Operation {
            index: 3,
            source: "boom".to_owned(),
        };
        assert!(!error.is_cancelled());
        assert_eq!(error.operation(), Some((3, &"boom".to_owned())));
    }

    #[test]
    fn display_mentions_the_failed_index() {
        let error: IterationError<String> = IterationError::Operation {
            index: 42,
            source: "boom".to_owned(),
        };
        assert_eq!(
            error.to_string(),
            "the operation failed on the item at index 42"
        );
    }
}
