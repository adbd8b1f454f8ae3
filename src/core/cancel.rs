/*!
 * Cancellation signalling
 *
 * A single cancellation source fans out to any number of observers. The
 * token exposes both a cheap flag check and a channel receiver that
 * disconnects on cancel, so consumer loops can wait for it inside
 * `crossbeam_channel::select!`.
 */

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Create a connected cancellation pair.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = bounded::<()>(0);
    let flag = Arc::new(AtomicBool::new(false));
    let handle = CancelHandle {
        flag: Arc::clone(&flag),
        tx: Arc::new(Mutex::new(Some(tx))),
    };
    let token = CancelToken { flag, rx };
    (handle, token)
}

/// The requesting side: call `cancel()` once to release every waiter.
///
/// Dropping the last handle clone also releases the waiters (observed as
/// cancellation), so owners must keep a handle alive for as long as the
/// work should continue.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        // Dropping the sender disconnects every receiver clone, which
        // unblocks all selects immediately.
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// The observing side. Cloneable; all clones observe the same signal.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Receiver for use in `select!`; it becomes ready (disconnected) when
    /// cancellation fires and never yields a message before that.
    pub fn channel(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Sleep for up to `timeout`, returning true if cancelled in the
    /// meantime.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            // Disconnect is the cancel signal; a message never arrives.
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_not_cancelled_initially() {
        let (_handle, token) = cancellation();
        assert!(!token.is_cancelled());
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_cancel_sets_flag_and_unblocks() {
        let (handle, token) = cancellation();
        handle.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_cancel_unblocks_other_thread() {
        let (handle, token) = cancellation();
        let waiter = thread::spawn(move || token.wait_timeout(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        handle.cancel();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_clones_observe_cancel() {
        let (handle, token) = cancellation();
        let token2 = token.clone();
        let handle2 = handle.clone();
        handle2.cancel();
        assert!(token.is_cancelled());
        assert!(token2.is_cancelled());
    }
}
