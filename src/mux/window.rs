//! Per-stream send credit.
//!
//! Each stream may have at most `window` unacknowledged bytes in flight. A
//! writer reserves credit before queueing a data frame and parks when the
//! peer has not returned any; `WindowUpdate` frames from the peer grant it
//! back. Credit is tracked per stream, so one stalled consumer never blocks
//! writers on other streams.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::{PluginError, Result};

/// Default initial window per stream (256 KiB).
pub const DEFAULT_INITIAL_WINDOW: u32 = 256 * 1024;

#[derive(Debug)]
pub(crate) struct SendWindow {
    credit: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            credit: AtomicU64::new(u64::from(initial)),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Take up to `want` bytes of credit, waiting until at least one byte is
    /// available.
    ///
    /// Fails with [`PluginError::ConnectionClosed`] once the window is closed.
    pub(crate) async fn reserve(&self, want: usize) -> Result<usize> {
        let want = want as u64;
        loop {
            // Register before checking so a grant between the check and the
            // await is not lost.
            let notified = self.notify.notified();

            if self.closed.load(Ordering::Acquire) {
                return Err(PluginError::ConnectionClosed);
            }

            let current = self.credit.load(Ordering::Acquire);
            if current > 0 {
                let take = current.min(want);
                if self
                    .credit
                    .compare_exchange(current, current - take, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(take as usize);
                }
                continue;
            }

            notified.await;
        }
    }

    /// Return credit granted by the peer.
    pub(crate) fn grant(&self, credit: u32) {
        self.credit.fetch_add(u64::from(credit), Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    /// Wake every waiter with an error; no further credit will arrive.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> u64 {
        self.credit.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reserve_takes_partial_credit() {
        let window = SendWindow::new(10);
        assert_eq!(window.reserve(4).await.unwrap(), 4);
        assert_eq!(window.reserve(100).await.unwrap(), 6);
        assert_eq!(window.available(), 0);
    }

    #[tokio::test]
    async fn test_reserve_waits_for_grant() {
        let window = Arc::new(SendWindow::new(0));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(8).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        window.grant(5);
        assert_eq!(waiter.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let window = Arc::new(SendWindow::new(0));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.reserve(1).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        window.close();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PluginError::ConnectionClosed));
    }
}
