//! Watchdog timers for in-flight native transfers
//!
//! Control and OUT transfers get a deadline; when it fires, the stalled
//! native operation is unlinked and completes through the normal callback
//! path with a timeout/unlink status. Completion disarms the timer.

use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::debug;

type Action = Box<dyn FnOnce() + Send>;

struct Entry {
    deadline: Instant,
    seq: u64,
    disarmed: Arc<AtomicBool>,
    action: Option<Action>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct SchedulerInner {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    shutdown: bool,
}

/// One timer thread serving every dispatcher
pub struct TimeoutScheduler {
    inner: Mutex<SchedulerInner>,
    cv: Condvar,
}

/// Disarms its timer when completion beats the deadline.
pub struct TimerHandle {
    disarmed: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(self) {
        self.disarmed.store(true, Ordering::Release);
    }
}

impl TimeoutScheduler {
    pub fn new() -> Arc<TimeoutScheduler> {
        Arc::new(TimeoutScheduler {
            inner: Mutex::new(SchedulerInner {
                heap: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// Spawn the firing thread.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        std::thread::Builder::new()
            .name("usb-timeouts".into())
            .spawn(move || scheduler.run())
            .expect("spawn timeout thread")
    }

    /// Arm `action` to run at `deadline` unless the handle is canceled
    /// first.
    pub fn schedule(&self, after: Duration, action: Action) -> TimerHandle {
        let disarmed = Arc::new(AtomicBool::new(false));
        {
            let mut inner = self.inner.lock();
            inner.seq += 1;
            let entry = Entry {
                deadline: Instant::now() + after,
                seq: inner.seq,
                disarmed: Arc::clone(&disarmed),
                action: Some(action),
            };
            inner.heap.push(Reverse(entry));
        }
        self.cv.notify_one();
        TimerHandle { disarmed }
    }

    pub fn shutdown(&self) {
        self.inner.lock().shutdown = true;
        self.cv.notify_all();
    }

    fn run(&self) {
        loop {
            let mut due: Vec<Action> = Vec::new();
            {
                let mut inner = self.inner.lock();
                loop {
                    if inner.shutdown {
                        return;
                    }
                    let now = Instant::now();
                    match inner.heap.peek() {
                        None => {
                            self.cv.wait(&mut inner);
                        }
                        Some(Reverse(entry)) if entry.deadline > now => {
                            let deadline = entry.deadline;
                            let _ = self.cv.wait_until(&mut inner, deadline);
                        }
                        Some(_) => break,
                    }
                }

                let now = Instant::now();
                while let Some(Reverse(entry)) = inner.heap.peek() {
                    if entry.deadline > now {
                        break;
                    }
                    let mut entry = inner.heap.pop().expect("peeked entry").0;
                    if !entry.disarmed.load(Ordering::Acquire) {
                        if let Some(action) = entry.action.take() {
                            due.push(action);
                        }
                    }
                }
            }

            // Fire with the lock dropped; unlink paths take other locks.
            for action in due {
                debug!("transfer watchdog fired");
                action();
            }
        }
    }
}
