use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// The task panicked or was aborted.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct JoinError(#[from] tokio::task::JoinError);

/// Handle to a task started with [`spawn`].
///
/// The task is aborted when the handle is dropped, so a task never
/// outlives the scope that owns its handle. Awaiting the handle yields
/// the output of the task.
pub struct JoinHandle<T> {
    handle: tokio::task::JoinHandle<T>,
}

pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static + Send,
    T: Send + 'static,
{
    JoinHandle {
        handle: tokio::spawn(future),
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map_err(JoinError::from)
    }
}
