use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Stop signal shared between a component and the tasks it spawns.
///
/// Cloning yields a handle to the same signal. Cancelling it wakes every task
/// spawned through [`SignalOfStop::spawn`] and every future raced through
/// [`SignalOfStop::select`].
#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    token: CancellationToken,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            token: CancellationToken::new(),
        }
    }

    /// A signal that is cancelled together with `self` but can also be
    /// cancelled on its own.
    pub fn child(&self) -> SignalOfStop {
        SignalOfStop {
            token: self.token.child_token(),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal is cancelled.
    pub async fn wait_cancellation(&self) {
        self.token.cancelled().await
    }

    /// Runs `fut` until it completes or the signal fires, whichever is first.
    /// Returns `None` when cancelled.
    pub async fn select<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            out = fut => Some(out),
        }
    }

    /// Spawns `fut` on the runtime; the task is dropped when the signal fires.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<Option<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let sos = self.clone();
        tokio::spawn(async move { sos.select(fut).await })
    }
}
