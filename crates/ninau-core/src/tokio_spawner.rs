//! Tokio-backed job spawner.
//!
//! Spawning each claim-and-execute task onto the runtime lets handlers run
//! on other threads instead of inside the worker's own poll loop. A panic
//! in a handler is confined to its task: the join handle reports it, the
//! worker logs it, and the claimed record is left for the reaper.

use pin_project_lite::pin_project;

use crate::worker::JobSpawner;

/// Spawn claim-and-execute tasks onto the Tokio runtime.
pub struct TokioSpawner;

pin_project! {
    /// Join handle that resolves to `()` and logs instead of resuming a
    /// handler panic.
    pub struct TokioJobHandle {
        #[pin]
        handle: tokio::task::JoinHandle<()>,
    }
}

impl Future for TokioJobHandle {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let this = self.project();
        match this.handle.poll(cx) {
            std::task::Poll::Ready(result) => {
                if let Err(error) = result {
                    if error.is_panic() {
                        tracing::error!(error = %error, "job task panicked");
                    } else {
                        tracing::error!(error = %error, "job task was cancelled");
                    }
                }
                std::task::Poll::Ready(())
            }
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl JobSpawner for TokioSpawner {
    type JobHandle<Fut>
        = TokioJobHandle
    where
        Fut: Future<Output = ()> + Send + 'static;

    fn spawn<Fut>(fut: Fut) -> Self::JobHandle<Fut>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        TokioJobHandle {
            handle: tokio::spawn(fut),
        }
    }
}
