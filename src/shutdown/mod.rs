//! Shutdown signalling for background tasks
//!
//! One [`Shutdown`] owns the signal; every background task holds a
//! [`ShutdownSignal`] and stops scheduling work once it fires.

use tokio::sync::watch;

/// Owner side of the shutdown signal
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

/// Task side of the shutdown signal
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// A new receiver for a background task
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Tell every task to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Resolves once shutdown has been triggered or the owner is gone
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_all_signals() {
        let shutdown = Shutdown::new();
        let mut first = shutdown.signal();
        let mut second = shutdown.signal();

        let waiter = tokio::spawn(async move {
            first.cancelled().await;
        });

        assert!(!second.is_cancelled());
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        second.cancelled().await;
        assert!(second.is_cancelled());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_signal_after_trigger_is_cancelled() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut late = shutdown.signal();
        late.cancelled().await;
        assert!(late.is_cancelled());
    }

    #[tokio::test]
    async fn test_dropped_owner_releases_waiters() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.signal();
        drop(shutdown);
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .unwrap();
    }
}
