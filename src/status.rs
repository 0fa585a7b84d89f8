//! Composable completion handles
//!
//! A `Status` resolves when some hardware operation has finished. Handles
//! created with [`Status::spawn`] make progress on the runtime whether or
//! not anyone is awaiting them, which is what lets motion and detector
//! arming run side by side on a single cooperative executor.

use futures::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::device::ChannelValue;
use crate::error::{NyxError, Result};

/// Handle for an operation that completes later
pub struct Status {
    inner: BoxFuture<'static, Result<()>>,
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status").finish_non_exhaustive()
    }
}

impl Status {
    /// Already finished
    pub fn done() -> Self {
        Self {
            inner: future::ready(Ok(())).boxed(),
        }
    }

    /// Already failed
    pub fn failed(err: NyxError) -> Self {
        Self {
            inner: future::ready(Err(err)).boxed(),
        }
    }

    /// Run `fut` as its own task; the handle resolves with its result
    pub fn spawn<F>(fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::from_task(tokio::spawn(fut))
    }

    /// Wrap an already spawned task. An aborted task resolves as a task error.
    pub fn from_task(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            inner: async move { handle.await? }.boxed(),
        }
    }

    /// Resolves once both handles have; the first failure wins
    pub fn and(self, other: Status) -> Status {
        Self {
            inner: future::try_join(self, other).map(|r| r.map(|_| ())).boxed(),
        }
    }

    /// Run `callback` as soon as this handle succeeds, even if nobody
    /// awaits the returned handle
    pub fn then<F, Fut>(self, callback: F) -> Status
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Status::spawn(async move {
            self.await?;
            callback().await
        })
    }

    /// Bound the wait; `None` waits forever
    pub fn with_timeout(self, limit: Option<Duration>, what: impl Into<String>) -> Status {
        let Some(limit) = limit else {
            return self;
        };
        let what = what.into();
        Self {
            inner: async move {
                let started = Instant::now();
                match tokio::time::timeout(limit, self).await {
                    Ok(result) => result,
                    Err(_) => Err(NyxError::timeout(what, started.elapsed())),
                }
            }
            .boxed(),
        }
    }

    /// Resolves when `predicate(old, new)` first holds for a value change
    /// observed on `rx`. Only changes after subscription are considered.
    pub fn transition<P>(
        mut rx: watch::Receiver<ChannelValue>,
        channel: impl Into<String>,
        predicate: P,
    ) -> Status
    where
        P: Fn(&ChannelValue, &ChannelValue) -> bool + Send + 'static,
    {
        let channel = channel.into();
        let mut old = rx.borrow_and_update().clone();
        Status::spawn(async move {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| NyxError::device(&channel, "subscription closed"))?;
                let new = rx.borrow_and_update().clone();
                debug!("{}: {} -> {}", channel, old, new);
                if predicate(&old, &new) {
                    return Ok(());
                }
                old = new;
            }
        })
    }
}

impl Future for Status {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}
