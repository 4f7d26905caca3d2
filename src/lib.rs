// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod cancel;
mod context;
mod engine;
mod error;
mod invocation;
mod join;
mod macros;
mod source;
mod stream;

pub use cancel::{CancelToken, Cancelled};
pub use engine::{IterationBuilder, Parallelism};
pub use error::IterationError;
pub use stream::{IterationStream, StreamItem};

// The execution context capability: anything that can spawn a detached task.
pub use futures::task::{Spawn, SpawnError};
