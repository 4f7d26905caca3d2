// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Cooperative cancellation tokens.

use futures::future::FusedFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A one-way, monotonic cancellation flag that can be polled and awaited.
///
/// Tokens are cheap to clone: all clones observe the same flag. Once
/// [`cancel()`](Self::cancel) has been called, the token stays cancelled
/// forever.
///
/// The engine checks the token once per item before invoking the operation,
/// and races it against the final join. It never preempts an invocation that
/// has already started.
///
/// ```rust
/// # use paraloop::CancelToken;
/// let token = CancelToken::new();
/// let clone = token.clone();
/// assert!(!clone.is_cancelled());
/// token.cancel();
/// assert!(clone.is_cancelled());
/// ```
#[derive(Clone)]
pub struct CancelToken {
    /// Shared state, or [`None`] for a token that can never be cancelled.
    inner: Option<Arc<Shared>>,
}

/// State shared between all clones of a cancellable token.
struct Shared {
    /// Whether the token has been cancelled. Transitions to `true` at most
    /// once and never back.
    cancelled: AtomicBool,
    /// Wakers of the pending [`Cancelled`] futures.
    waiters: Mutex<Waiters>,
}

/// Registry of wakers waiting for the cancellation flag.
struct Waiters {
    /// Key to hand out to the next registered waiter.
    next_key: u64,
    /// Registered wakers, identified by the key of the future that owns the
    /// registration.
    wakers: Vec<(u64, Waker)>,
}

impl CancelToken {
    /// Creates a new token, initially not cancelled.
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                waiters: Mutex::new(Waiters {
                    next_key: 0,
                    wakers: Vec::new(),
                }),
            })),
        }
    }

    /// Creates a token that can never be cancelled.
    ///
    /// With such a token, the engine's cancellation-aware wait degenerates to
    /// a plain wait, and [`cancel()`](Self::cancel) has no effect.
    pub fn never() -> Self {
        Self { inner: None }
    }

    /// Cancels the token, waking up all pending [`Cancelled`] futures.
    ///
    /// Subsequent calls have no effect, and neither has any call on a token
    /// created with [`never()`](Self::never).
    pub fn cancel(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let wakers = {
            let mut waiters = inner.waiters.lock().unwrap();
            std::mem::take(&mut waiters.wakers)
        };
        for (_, waker) in wakers {
            waker.wake();
        }
    }

    /// Returns whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|inner| inner.cancelled.load(Ordering::SeqCst))
    }

    /// Returns whether the token can be cancelled at all, i.e. whether it
    /// wasn't created with [`never()`](Self::never).
    pub fn is_cancellable(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns a future that completes when the token transitions to
    /// cancelled, without polling in a loop.
    ///
    /// The future's registration on the token is released when the future is
    /// dropped, so racing it against other futures doesn't leak.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            token: self.clone(),
            key: None,
            done: false,
        }
    }

    /// Number of pending registrations, to check for leaks.
    #[cfg(test)]
    fn num_waiters(&self) -> usize {
        match &self.inner {
            Some(inner) => inner.waiters.lock().unwrap().wakers.len(),
            None => 0,
        }
    }
}

impl Default for CancelToken {
    /// Returns a token that can never be cancelled.
    fn default() -> Self {
        Self::never()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancellable", &self.is_cancellable())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`CancelToken::cancelled()`], that completes when the
/// token is cancelled.
///
/// For a token created with [`CancelToken::never()`], this future never
/// completes.
#[must_use = "futures do nothing unless polled"]
pub struct Cancelled {
    /// Token this future is waiting on.
    token: CancelToken,
    /// Key of this future's waker registration, if any.
    key: Option<u64>,
    /// Whether this future has already completed.
    done: bool,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        let Some(inner) = &this.token.inner else {
            return Poll::Pending;
        };
        if inner.cancelled.load(Ordering::SeqCst) {
            this.done = true;
            this.key = None;
            return Poll::Ready(());
        }

        let mut waiters = inner.waiters.lock().unwrap();
        // Re-check under the lock: a concurrent cancel() may have drained the
        // registry between the load above and taking the lock.
        if inner.cancelled.load(Ordering::SeqCst) {
            drop(waiters);
            this.done = true;
            this.key = None;
            return Poll::Ready(());
        }
        match this.key {
            Some(key) => match waiters.wakers.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1.clone_from(cx.waker()),
                None => waiters.wakers.push((key, cx.waker().clone())),
            },
            None => {
                let key = waiters.next_key;
                waiters.next_key += 1;
                waiters.wakers.push((key, cx.waker().clone()));
                this.key = Some(key);
            }
        }
        Poll::Pending
    }
}

impl FusedFuture for Cancelled {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl Drop for Cancelled {
    /// Releases this future's waker registration, if any.
    fn drop(&mut self) {
        if let (Some(inner), Some(key)) = (&self.token.inner, self.key) {
            if let Ok(mut waiters) = inner.waiters.lock() {
                waiters.wakers.retain(|(k, _)| *k != key);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::executor::block_on;
    use futures::future::{self, Either};
    use futures::pin_mut;
    use std::time::Duration;

    #[test]
    fn cancellation_is_monotonic() {
        let token = CancelToken::new();
        assert!(token.is_cancellable());
        assert!(!token.is_cancelled());

        token.cancel();
        assert!(token.is_cancelled());

        // Cancelling again is a no-op.
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn clones_observe_the_same_flag() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn never_token_cannot_be_cancelled() {
        let token = CancelToken::never();
        assert!(!token.is_cancellable());
        token.cancel();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancelled_future_completes_immediately_on_cancelled_token() {
        let token = CancelToken::new();
        token.cancel();
        block_on(token.cancelled());
    }

    #[test]
    fn cancelled_future_wakes_up_on_cancel() {
        let token = CancelToken::new();
        let clone = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            clone.cancel();
        });
        block_on(token.cancelled());
        handle.join().unwrap();
    }

    #[test]
    fn dropping_the_future_releases_the_registration() {
        let token = CancelToken::new();
        {
            let cancelled = token.cancelled();
            pin_mut!(cancelled);
            // Polling against a pending future registers a waker.
            let other = future::ready(());
            match block_on(future::select(cancelled.as_mut(), other)) {
                Either::Left(_) => panic!("the token wasn't cancelled"),
                Either::Right(_) => (),
            }
            assert_eq!(token.num_waiters(), 1);
        }
        assert_eq!(token.num_waiters(), 0);
    }

    #[test]
    fn cancel_drains_the_registry() {
        let token = CancelToken::new();
        let cancelled = token.cancelled();
        pin_mut!(cancelled);
        let pending = future::pending::<()>();
        pin_mut!(pending);
        let select = future::select(cancelled.as_mut(), pending);
        pin_mut!(select);
        assert!(block_on(future::poll_fn(|cx| {
            Poll::Ready(select.as_mut().poll(cx).is_pending())
        })));
        assert_eq!(token.num_waiters(), 1);

        token.cancel();
        assert_eq!(token.num_waiters(), 0);
        block_on(cancelled);
    }
}
