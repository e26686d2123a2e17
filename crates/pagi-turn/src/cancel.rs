//! Per-turn cancellation signal.
//!
//! Set-only: once raised it stays raised until the turn ends and a fresh
//! signal is created for the next one. The first setter's reason is kept.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

const CLEAR: u8 = 0;

/// Who raised the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Sustained user speech during playback.
    BargeIn,
    /// Stop request from the presentation layer.
    StopRequest,
}

impl CancelReason {
    fn code(self) -> u8 {
        match self {
            CancelReason::BargeIn => 1,
            CancelReason::StopRequest => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CancelReason::BargeIn),
            2 => Some(CancelReason::StopRequest),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    notify: Notify,
}

/// Shared, cloneable, monotonic cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `true` only for the call that actually set it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(CLEAR, reason.code(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.inner.notify.notify_waiters();
        }
        won
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) != CLEAR
    }

    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_code(self.inner.state.load(Ordering::SeqCst))
    }

    /// Resolves once the signal is raised (immediately if it already is).
    pub async fn cancelled(&self) {
        loop {
            // Register before checking so a concurrent cancel cannot slip between
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_reason_wins_and_never_resets() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        assert_eq!(signal.reason(), None);

        assert!(signal.cancel(CancelReason::BargeIn));
        assert!(!signal.cancel(CancelReason::StopRequest));
        assert!(signal.is_cancelled());
        assert_eq!(signal.reason(), Some(CancelReason::BargeIn));

        let clone = signal.clone();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_wakes_waiters() {
        let signal = CancellationSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.cancel(CancelReason::StopRequest);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_set() {
        let signal = CancellationSignal::new();
        signal.cancel(CancelReason::BargeIn);
        tokio::time::timeout(Duration::from_millis(50), signal.cancelled())
            .await
            .expect("should already be cancelled");
    }
}
