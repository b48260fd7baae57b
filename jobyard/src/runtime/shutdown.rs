use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not
        // missed.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns true when the sleep was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => self.is_cancelled(),
        }
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(timeout(Duration::from_secs(1), waiter).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_after_cancel() {
        let token = ShutdownToken::new();
        token.cancel();
        assert!(token.is_cancelled());
        assert!(timeout(Duration::from_millis(50), token.cancelled())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted_by_cancel() {
        let token = ShutdownToken::new();
        let sleeper = {
            let token = token.clone();
            tokio::spawn(async move { token.sleep(Duration::from_secs(3600)).await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        assert!(sleeper.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_to_completion() {
        let token = ShutdownToken::new();
        assert!(!token.sleep(Duration::from_millis(10)).await);
    }
}
