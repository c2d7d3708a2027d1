//! Barge-in signal shared between the segmenter and the playback watcher
//!
//! A resettable boolean condition: the segmenter triggers it on speech onset
//! and clears it when the speech episode has been emitted as a segment.
//! Multiple onsets while triggered collapse into one signal.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Resettable "speech has started" condition. Clones share the same state.
#[derive(Debug, Clone)]
pub struct BargeInSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for BargeInSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl BargeInSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Set the signal and wake every waiter. No effect if already triggered.
    pub fn trigger(&self) {
        let changed = self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
        if changed {
            debug!("Barge-in signal triggered");
        }
    }

    /// Return the signal to idle.
    pub fn clear(&self) {
        let changed = self.tx.send_if_modified(|triggered| std::mem::replace(triggered, false));
        if changed {
            debug!("Barge-in signal cleared");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Suspend until the signal is triggered. Returns immediately if it
    /// already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_triggered() {
        let signal = BargeInSignal::new();
        signal.trigger();
        timeout(Duration::from_millis(50), signal.wait())
            .await
            .expect("wait should not block on a triggered signal");
    }

    #[tokio::test]
    async fn test_trigger_is_idempotent() {
        let signal = BargeInSignal::new();
        let mut rx = signal.tx.subscribe();
        signal.trigger();
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        signal.trigger();
        assert!(!rx.has_changed().unwrap(), "second trigger must not notify again");
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_trigger_wakes_all_waiters() {
        let signal = BargeInSignal::new();
        let a = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });
        let b = tokio::spawn({
            let signal = signal.clone();
            async move { signal.wait().await }
        });

        tokio::task::yield_now().await;
        assert!(!a.is_finished());
        signal.trigger();

        timeout(Duration::from_millis(100), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("both waiters should wake");
    }

    #[tokio::test]
    async fn test_clear_resets_to_idle() {
        let signal = BargeInSignal::new();
        signal.trigger();
        signal.clear();
        assert!(!signal.is_triggered());
        assert!(timeout(Duration::from_millis(20), signal.wait()).await.is_err());
    }
}
