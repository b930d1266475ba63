use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::Shared as FuturesShared;
use futures_util::FutureExt;

/// Spawns `fut` onto the tokio runtime and aborts it if the handle is dropped
/// before completion. Used for fire-and-forget continuations (e.g. the
/// apply-block parent recursion) that must not outlive their caller.
pub struct JoinTask<T> {
    handle: tokio::task::JoinHandle<T>,
}

impl<T: Send + 'static> JoinTask<T> {
    pub fn new(fut: impl Future<Output = T> + Send + 'static) -> Self {
        Self {
            handle: tokio::spawn(fut),
        }
    }
}

impl<T> Drop for JoinTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl<T: Send + 'static> Future for JoinTask<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(value),
            Poll::Ready(Err(err)) => {
                std::panic::resume_unwind(err.into_panic());
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A future whose result is cached and can be awaited by any number of
/// clones. Backs the wait-for registry's single-worker-many-waiters model.
#[derive(Clone)]
pub struct Shared<F: Future> {
    inner: FuturesShared<Pin<Box<dyn Future<Output = F::Output> + Send>>>,
}

impl<F> Shared<F>
where
    F: Future + Send + 'static,
    F::Output: Clone,
{
    pub fn new(fut: F) -> Self {
        Self {
            inner: (Box::pin(fut) as Pin<Box<dyn Future<Output = F::Output> + Send>>).shared(),
        }
    }
}

impl<F> Future for Shared<F>
where
    F: Future,
    F::Output: Clone,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll(cx)
    }
}

/// Reference-counted cell used where a value must be read by many and
/// written by exactly one actor, with no contention expected on the read path.
pub type Shareable<T> = Arc<parking_lot::RwLock<T>>;
