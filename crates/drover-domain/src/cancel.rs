//! One-shot cancellation tokens with an optional cause.
//!
//! A `CancelToken` is registered in the store for every active run and
//! session. Engines hold it strongly and check it around blocking
//! operations; the store holds only a `WeakCancelToken` so a finished
//! engine does not keep tokens alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    reason: OnceLock<String>,
    notify: Notify,
}

/// A cancellation token that can be checked or awaited by the runtime loop.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                reason: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation with the default cause. Idempotent.
    pub fn cancel(&self) {
        self.cancel_with_reason("canceled");
    }

    /// Signal cancellation with a cause. The first cause wins.
    pub fn cancel_with_reason(&self, reason: &str) {
        let _ = self.inner.reason.set(reason.to_owned());
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// The cancellation cause, defaulting to "canceled".
    pub fn reason(&self) -> String {
        self.inner
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| "canceled".to_owned())
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Downgrade to a weak handle for registry storage.
    pub fn downgrade(&self) -> WeakCancelToken {
        WeakCancelToken {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak handle to a cancel token. Upgrading fails once every strong
/// holder (the executing engine) has dropped the token.
#[derive(Clone)]
pub struct WeakCancelToken {
    inner: Weak<Inner>,
}

impl WeakCancelToken {
    pub fn upgrade(&self) -> Option<CancelToken> {
        self.inner.upgrade().map(|inner| CancelToken { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.reason(), "canceled");
    }

    #[test]
    fn first_reason_wins() {
        let token = CancelToken::new();
        token.cancel_with_reason("user request");
        token.cancel_with_reason("later");
        assert_eq!(token.reason(), "user request");
    }

    #[test]
    fn clone_shares_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn weak_handle_drops_with_strong() {
        let token = CancelToken::new();
        let weak = token.downgrade();
        assert!(weak.upgrade().is_some());
        drop(token);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_set() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
