/*!
 * Lossy bounded channel with drop-oldest overflow
 *
 * Producers are non-blocking: when the queue is full the oldest unconsumed
 * entry is discarded to admit the new one, favoring recency over
 * completeness. The same primitive backs both the volume-event queue and
 * the log sink queue.
 */

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Create a lossy bounded channel with the given capacity (minimum 1).
pub fn lossy<T>(capacity: usize) -> (LossySender<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity.max(1));
    let sender = LossySender {
        tx,
        drain: rx.clone(),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

/// Sending half of a lossy bounded channel.
///
/// Holds a receiver clone so it can discard the oldest entry when the queue
/// is full; `send` therefore never blocks and never fails.
pub struct LossySender<T> {
    tx: Sender<T>,
    drain: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for LossySender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            drain: self.drain.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> LossySender<T> {
    /// Enqueue an item, discarding the oldest entries if the queue is full.
    /// Returns how many entries were discarded to admit this one.
    pub fn send(&self, item: T) -> u64 {
        let mut item = item;
        let mut discarded = 0u64;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => {
                    if discarded > 0 {
                        self.dropped.fetch_add(discarded, Ordering::Relaxed);
                    }
                    return discarded;
                }
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.drain.try_recv().is_ok() {
                        discarded += 1;
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    // Cannot happen while this sender holds a receiver
                    // clone, but a dropped item is the correct answer.
                    return discarded;
                }
            }
        }
    }

    /// Total entries discarded across the channel's lifetime.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Current queue length.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}
