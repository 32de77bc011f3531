//! Notification doorbells
//!
//! Fire-and-forget wakeups between the two sides of a link. A doorbell is
//! a bounded(1) channel: signaling an already-signaled doorbell is a
//! no-op, so producers can ring it from any context without blocking.
//! Closing the signal side wakes the waiter with `false`, which is how
//! workers learn to shut down.

use async_channel::{Receiver, Sender, bounded};

/// Create a connected doorbell pair.
pub fn doorbell() -> (Doorbell, DoorbellWaiter) {
    let (tx, rx) = bounded(1);
    (Doorbell { tx }, DoorbellWaiter { rx })
}

/// Signal side; clone freely to add wake sources for one waiter.
#[derive(Clone)]
pub struct Doorbell {
    tx: Sender<()>,
}

impl Doorbell {
    /// Wake the waiter. Never blocks; a pending wakeup is sufficient.
    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }

    /// Close the doorbell, waking the waiter for shutdown.
    pub fn close(&self) {
        self.tx.close();
    }
}

/// Wait side, owned by exactly one worker loop.
pub struct DoorbellWaiter {
    rx: Receiver<()>,
}

impl DoorbellWaiter {
    /// Block until signaled. Returns `false` once the doorbell is closed.
    pub fn wait(&self) -> bool {
        self.rx.recv_blocking().is_ok()
    }

    /// Consume a pending signal without blocking.
    pub fn try_wait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// True once every signal side has been dropped or closed.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_saturates() {
        let (bell, waiter) = doorbell();
        bell.signal();
        bell.signal();
        bell.signal();

        assert!(waiter.try_wait());
        // All three signals collapsed into one wakeup.
        assert!(!waiter.try_wait());
    }

    #[test]
    fn close_wakes_waiter() {
        let (bell, waiter) = doorbell();
        let handle = std::thread::spawn(move || waiter.wait());
        bell.close();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn cloned_signals_share_one_waiter() {
        let (bell, waiter) = doorbell();
        let other = bell.clone();

        other.signal();
        assert!(waiter.try_wait());

        bell.signal();
        assert!(waiter.try_wait());
    }
}
