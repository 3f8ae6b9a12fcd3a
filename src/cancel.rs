//! Cooperative cancellation tokens.
//!
//! A [`CancellationSource`] hands out [`Cancellation`] tokens. Operations that
//! accept a token (`read`, `lock`, mutex `acquire`) fail with
//! [`FileError::Cancelled`] as soon as the source is cancelled.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::future::{select, Either};
use slab::Slab;

use crate::error::{FileError, Result};

#[derive(Default)]
struct CancelState {
    cancelled: Cell<bool>,
    waiters: RefCell<Slab<Waker>>,
}

/// Owner side of a cancellation token.
#[derive(Default)]
pub struct CancellationSource {
    state: Rc<CancelState>,
}

impl CancellationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Cancellation {
        Cancellation {
            state: Rc::clone(&self.state),
        }
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        if self.state.cancelled.replace(true) {
            return;
        }
        let waiters: Vec<Waker> = self.state.waiters.borrow_mut().drain().collect();
        tracing::trace!("CancellationSource: waking {} waiters", waiters.len());
        for waker in waiters {
            waker.wake();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }
}

/// Observer side of a cancellation token; cheap to clone.
#[derive(Clone)]
pub struct Cancellation {
    state: Rc<CancelState>,
}

impl Cancellation {
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// Fail with [`FileError::Cancelled`] if the token already fired.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FileError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Future resolving once the token fires.
    pub fn cancelled(&self) -> WaitCancelled {
        WaitCancelled {
            state: Rc::clone(&self.state),
            key: None,
        }
    }
}

impl std::fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Future returned by [`Cancellation::cancelled`].
pub struct WaitCancelled {
    state: Rc<CancelState>,
    key: Option<usize>,
}

impl Future for WaitCancelled {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.state.cancelled.get() {
            // cancel() already drained the slab
            this.key = None;
            return Poll::Ready(());
        }
        let mut waiters = this.state.waiters.borrow_mut();
        match this.key {
            Some(key) if waiters.contains(key) => {
                waiters[key] = cx.waker().clone();
            }
            _ => {
                this.key = Some(waiters.insert(cx.waker().clone()));
            }
        }
        Poll::Pending
    }
}

impl Drop for WaitCancelled {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut waiters = self.state.waiters.borrow_mut();
            if waiters.contains(key) {
                waiters.remove(key);
            }
        }
    }
}

/// Race `future` against `cancellation`.
///
/// A token that already fired wins without polling `future` at all. When the
/// token fires first, `future` is dropped; callers that own in-flight requests
/// cancel them from their own drop guards.
pub async fn with_cancellation<F>(future: F, cancellation: Option<&Cancellation>) -> Result<F::Output>
where
    F: Future,
{
    let Some(cancellation) = cancellation else {
        return Ok(future.await);
    };
    cancellation.check()?;

    let future = std::pin::pin!(future);
    match select(future, cancellation.cancelled()).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(FileError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    #[test]
    fn cancel_wakes_waiters_once() {
        let source = CancellationSource::new();
        let token = source.token();
        let mut wait = Box::pin(token.cancelled());
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(wait.as_mut().poll(&mut cx).is_pending());
        assert_eq!(source.state.waiters.borrow().len(), 1);
        source.cancel();
        source.cancel();
        assert!(token.is_cancelled());
        assert!(wait.as_mut().poll(&mut cx).is_ready());
        assert!(matches!(token.check(), Err(FileError::Cancelled)));
    }

    #[test]
    fn dropped_waiter_deregisters() {
        let source = CancellationSource::new();
        let token = source.token();
        {
            let mut wait = Box::pin(token.cancelled());
            let waker = noop_waker();
            let mut cx = Context::from_waker(&waker);
            assert!(wait.as_mut().poll(&mut cx).is_pending());
        }
        assert!(source.state.waiters.borrow().is_empty());
    }

    #[test]
    fn pre_cancelled_token_skips_future() {
        let source = CancellationSource::new();
        source.cancel();
        let token = source.token();
        let polled = Rc::new(Cell::new(false));
        let p = polled.clone();
        let result = futures::executor::block_on(with_cancellation(
            async move {
                p.set(true);
            },
            Some(&token),
        ));
        assert!(matches!(result, Err(FileError::Cancelled)));
        assert!(!polled.get());
    }
}
