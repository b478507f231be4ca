//! Helpers for driving reconcile futures
use futures::{Future, FutureExt};
use std::{pin::Pin, task::Poll};
use tokio::{runtime::Handle, task::JoinHandle};

/// A [`JoinHandle`] that cancels the [`Future`] when dropped, rather than detaching it
pub struct CancelableJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> CancelableJoinHandle<T>
where
    T: Send + 'static,
{
    /// Spawn `future` on `runtime`, tied to the lifetime of the returned handle
    pub fn spawn(future: impl Future<Output = T> + Send + 'static, runtime: &Handle) -> Self {
        CancelableJoinHandle {
            inner: runtime.spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort();
    }
}

impl<T> Future for CancelableJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match self.inner.poll_unpin(cx) {
            Poll::Ready(Ok(output)) => Poll::Ready(output),
            // the task panicked, so propagate
            Poll::Ready(Err(err)) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            // cancelled, which only happens once the handle is dropped and never polled again
            Poll::Ready(Err(_)) | Poll::Pending => Poll::Pending,
        }
    }
}
