//! One-shot wall-clock timers that set a flag instead of interrupting.
//!
//! The debugger callback is the only safe place to terminate a debuggee,
//! so timeouts are delivered as a boolean checked on the debugger's
//! periodic tick rather than by cross-thread cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A one-shot timer running on a background thread.
///
/// When the budget elapses the shared flag is set; cancelling (or dropping)
/// the timer before that point leaves the flag untouched.
#[derive(Debug)]
pub struct OneShot {
    armed: Option<(SyncSender<()>, JoinHandle<()>)>,
}

impl OneShot {
    /// Arms a timer that sets `flag` after `budget` elapses.
    #[must_use]
    pub fn arm(budget: Duration, flag: Arc<AtomicBool>) -> Self {
        let (cancel, fired) = mpsc::sync_channel(1);
        let handle = std::thread::spawn(move || {
            if matches!(fired.recv_timeout(budget), Err(RecvTimeoutError::Timeout)) {
                flag.store(true, Ordering::SeqCst);
            }
        });
        OneShot {
            armed: Some((cancel, handle)),
        }
    }

    /// Cancels the timer without setting the flag.
    pub fn cancel(mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        if let Some((cancel, handle)) = self.armed.take() {
            let _ = cancel.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for OneShot {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::OneShot;

    #[test]
    fn fires_after_budget() {
        let flag = Arc::new(AtomicBool::new(false));
        let timer = OneShot::arm(Duration::from_millis(10), Arc::clone(&flag));
        std::thread::sleep(Duration::from_millis(100));
        assert!(flag.load(Ordering::SeqCst));
        timer.cancel();
    }

    #[test]
    fn cancel_prevents_firing() {
        let flag = Arc::new(AtomicBool::new(false));
        let timer = OneShot::arm(Duration::from_secs(10), Arc::clone(&flag));
        timer.cancel();
        assert!(!flag.load(Ordering::SeqCst));
    }
}
