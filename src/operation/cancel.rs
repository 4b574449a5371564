use tokio_util::sync::CancellationToken;

/// Cooperative cancellation signal handed to every running operation
///
/// Cancelling is idempotent and may happen from any thread. Work is never
/// preempted: it has to check [`CancelToken::is_cancelled`] (or await
/// [`CancelToken::cancelled`]) between steps and return on its own.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    /// Creates a token that is not cancelled
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once [`CancelToken::cancel`] was called on this token or a parent
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Signals cancellation to every clone and child of this token
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Completes when the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// Creates a token that is cancelled together with this one, but can also be
    /// cancelled on its own without affecting the parent
    #[must_use]
    pub fn child_token(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_cancel_visible_through_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_parent_cancels_child_but_not_reverse() {
        let parent = CancelToken::new();
        let child = parent.child_token();
        let sibling = parent.child_token();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_completes_from_other_thread() {
        let token = CancelToken::new();
        let remote = token.clone();
        std::thread::spawn(move || remote.cancel());
        token.cancelled().await;
        assert!(token.is_cancelled());
    }
}
