//! Process-wide shutdown signal.
//!
//! Every long-running loop selects on [`Shutdown::wait`]. The first
//! [`Shutdown::trigger`] wins; later triggers are ignored so a fatal path
//! fires exactly once.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Why the process is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Operator interrupt (Ctrl-C)
    Signal,
    /// Unrecoverable condition; the process exits with failure
    Fatal(String),
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => write!(f, "shutdown signal"),
            ShutdownReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// Cloneable handle to the shared shutdown state.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<Option<ShutdownReason>>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns `true` only for the first caller.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.tx.borrow().clone()
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|reason| reason.is_some()).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_trigger_wins() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        assert!(shutdown.trigger(ShutdownReason::Fatal("feed exhausted".to_string())));
        assert!(!shutdown.trigger(ShutdownReason::Signal));

        assert_eq!(
            shutdown.reason(),
            Some(ShutdownReason::Fatal("feed exhausted".to_string()))
        );
    }

    #[tokio::test]
    async fn test_wait_wakes_all_clones() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger(ShutdownReason::Signal);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let shutdown = Shutdown::new();
        shutdown.trigger(ShutdownReason::Signal);
        tokio_test::assert_ok!(
            tokio::time::timeout(Duration::from_millis(100), shutdown.wait()).await
        );
    }
}
