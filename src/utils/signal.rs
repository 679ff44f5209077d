//! Manual-reset async event
//!
//! Per-node `completion` and `context_ready` signals. A flag that, once
//! set, stays set: late waiters return immediately, so a parent batch can
//! wait on a child that already finished without deadlocking.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct SignalFlag {
    set: AtomicBool,
    notify: Notify,
}

impl SignalFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every current waiter. Idempotent.
    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Wait until the flag is set. Returns immediately if already set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering: set() between the check above and
            // notified() registration would otherwise be missed.
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_set_returns_immediately() {
        let flag = SignalFlag::new();
        flag.set();
        tokio::time::timeout(Duration::from_millis(50), flag.wait())
            .await
            .expect("wait should return immediately after set");
    }

    #[tokio::test]
    async fn test_waiters_unblock_on_set() {
        let flag = Arc::new(SignalFlag::new());
        let waiter = {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move { flag.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        flag.set();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should unblock")
            .expect("waiter task should not panic");
    }
}
