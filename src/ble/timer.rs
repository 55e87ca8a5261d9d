//! Single-shot scan timeout.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::ble::adapter::Event;

/// Identifies one arming of the scan timer.
///
/// A timeout event carrying a token other than the one currently armed is
/// stale and must be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TimerToken(pub u64);

impl TimerToken {
    /// The token following this one.
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// A cancellable single-shot timer.
///
/// When an armed timer elapses the implementation delivers
/// [`Event::ScanTimeout`] with the armed token.
#[cfg_attr(test, mockall::automock)]
pub trait ScanTimer {
    /// Arm the timer. Any previously armed timer is replaced.
    fn arm(&mut self, token: TimerToken, after: Duration);

    /// Cancel the timer armed with `token`, if it has not fired.
    fn cancel(&mut self, token: TimerToken);
}

/// [`ScanTimer`] backed by `tokio::time`.
///
/// Must be armed from within a tokio runtime.
pub struct TokioScanTimer {
    /// Where timeout events are posted.
    event_tx: mpsc::UnboundedSender<Event>,
    /// The pending sleep task, if any.
    pending: Option<(TimerToken, JoinHandle<()>)>,
}

impl TokioScanTimer {
    /// Create a timer that posts timeouts on `event_tx`.
    pub fn new(event_tx: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            event_tx,
            pending: None,
        }
    }

    /// Check if a timer is armed and has not fired.
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }
}

impl ScanTimer for TokioScanTimer {
    fn arm(&mut self, token: TimerToken, after: Duration) {
        if let Some((old, handle)) = self.pending.take() {
            trace!("Replacing scan timer {:?}", old);
            handle.abort();
        }

        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = event_tx.send(Event::ScanTimeout(token));
        });

        self.pending = Some((token, handle));
    }

    fn cancel(&mut self, token: TimerToken) {
        match self.pending.take() {
            Some((armed, handle)) if armed == token => {
                trace!("Cancelling scan timer {:?}", token);
                handle.abort();
            }
            other => self.pending = other,
        }
    }
}

impl Drop for TokioScanTimer {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.pending.take() {
            handle.abort();
        }
    }
}
