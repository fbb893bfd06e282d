use std::{
    future::{pending, Future},
    pin::Pin,
};

use tokio::sync::oneshot;

/// An external request for the worker process to stop.
///
/// The supervisor waits on this alongside its job source. Once it resolves, the supervisor stops accepting jobs and
/// drains.
pub struct StopSignal {
    signal: Option<Pin<Box<dyn Future<Output = ()> + Send>>>,
}

/// A handle to trigger a paired [`StopSignal`].
pub struct StopHandle {
    stop_tx: oneshot::Sender<()>,
}

impl StopSignal {
    /// Creates a new `StopSignal` and `StopHandle` pair.
    ///
    /// The signal resolves when the handle is triggered or dropped.
    pub fn paired() -> (Self, StopHandle) {
        let (stop_tx, stop_rx) = oneshot::channel();

        let signal = Self {
            signal: Some(Box::pin(async move {
                let _ = stop_rx.await;
            })),
        };

        (signal, StopHandle { stop_tx })
    }

    /// Creates a new `StopSignal` that resolves once `future` resolves.
    ///
    /// Typically wraps an OS signal listener.
    pub fn from_future<F: Future + Send + 'static>(future: F) -> Self {
        Self {
            signal: Some(Box::pin(async move {
                future.await;
            })),
        }
    }

    /// Creates a new `StopSignal` that never resolves.
    pub fn never() -> Self {
        Self {
            signal: Some(Box::pin(pending::<()>())),
        }
    }

    /// Waits for the stop request.
    ///
    /// Once the signal has been observed, subsequent calls return immediately. Dropping the returned future before it
    /// completes does not lose the signal.
    pub async fn wait(&mut self) {
        if let Some(signal) = self.signal.as_mut() {
            signal.await;
            self.signal = None;
        }
    }
}

impl StopHandle {
    /// Requests the paired signal to resolve.
    pub fn trigger(self) {
        let _ = self.stop_tx.send(());
    }
}
