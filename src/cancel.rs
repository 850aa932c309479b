//! Per-operation cancellation.
//!
//! Every externally triggered operation carries a [`Cancel`]. Store futures run
//! under [`Cancel::run`]; when the token fires the future is dropped, which
//! rolls back any open transaction, and the caller sees [`Error::Cancelled`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Clonable cancellation token with an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Cancel {
    inner: Arc<Inner>,
    deadline: Option<Instant>,
}

impl Cancel {
    /// A token that only fires when [`Cancel::cancel`] is called.
    pub fn new() -> Self {
        Cancel::default()
    }

    /// A token that also fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Cancel {
            deadline: Some(Instant::now() + timeout),
            ..Cancel::new()
        }
    }

    pub fn cancel(&self) {
        // ---
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the token is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        // ---
        let fired = async {
            loop {
                // Register before checking so a concurrent cancel() is not missed.
                let notified = self.inner.notify.notified();
                if self.inner.cancelled.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = fired => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => fired.await,
        }
    }

    /// Drive `fut` to completion unless the token fires first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        // ---
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::Cancelled),
            res = fut => res,
        }
    }
}
