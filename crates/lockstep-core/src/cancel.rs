//! CancelToken - 協調的キャンセル
//!
//! Long-running loops check the token at their iteration boundaries. The token
//! has no deadline of its own; callers combine it with their own timeouts.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Cooperative cancel signal shared by a job, its pipeline and its barriers.
///
/// Clones share state. A [`child`](Self::child) token is cancelled together with
/// its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token cancelled. Idempotent.
    pub fn signal(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Waits until the token is signalled or `timeout` elapses.
    ///
    /// Returns `true` when the token was signalled.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.inner.cancelled())
            .await
            .is_ok()
    }

    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }

    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `false` when the sleep was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        !self.wait_timeout(duration).await
    }
}
