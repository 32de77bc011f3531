//! Backend resource pools
//!
//! Two bounded pools shared by every connected device: pending-request
//! records and mapped-segment slots. Both sit behind one global lock, and
//! the lock is never held across a blocking operation. Exhaustion is
//! backpressure, not an error: dispatchers that came up empty get woken
//! through their registered doorbells when a free transitions a pool from
//! empty to non-empty.

use parking_lot::Mutex;
use tracing::trace;

use common::{Doorbell, MappedGrant};
use protocol::TransferKind;

use crate::timeout::TimerHandle;

/// Index of one pending-request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingId(pub u16);

/// Index of one segment slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentId(pub u16);

/// One mapped segment owned by a pending request
pub struct Segment {
    pub id: SegmentId,
    /// Taken at unmap time; the slot id goes back to the pool afterwards.
    pub mapped: Option<MappedGrant>,
}

/// Backend bookkeeping for one consumed, in-flight ring request
///
/// Owns its mapped segments and identifies the native I/O executing it.
/// Freed only after the native completion callback has run, via the
/// reaper worker.
pub struct PendingRequest {
    pub pending_id: PendingId,
    /// Ring request id, echoed in the response.
    pub ring_id: u64,
    pub kind: TransferKind,
    pub dir_in: bool,
    pub length: u32,
    /// Direct segments: data pages, or descriptor pages when indirect.
    pub segments: Vec<Segment>,
    /// Data segments referenced through indirect descriptor pages.
    pub indirect_segments: Vec<Segment>,
    /// Watchdog armed at submit time, disarmed on completion.
    pub timer: Option<TimerHandle>,
}

impl PendingRequest {
    pub fn is_indirect(&self) -> bool {
        !self.indirect_segments.is_empty()
    }
}

struct PoolsInner {
    pending_free: Vec<u16>,
    segment_free: Vec<u16>,
    /// Dispatchers to wake when a pool goes empty -> non-empty.
    waiters: Vec<Doorbell>,
}

/// The global pending-request and segment pools
pub struct BackendPools {
    inner: Mutex<PoolsInner>,
    pending_capacity: usize,
    segment_capacity: usize,
}

impl BackendPools {
    /// `pending` request slots and `pending * MAX_SEGMENTS_PER_REQUEST`
    /// segment slots, all initially free.
    pub fn new(pending: usize) -> BackendPools {
        assert!(pending > 0 && pending <= u16::MAX as usize);
        let segments = pending * protocol::MAX_SEGMENTS_PER_REQUEST;

        BackendPools {
            inner: Mutex::new(PoolsInner {
                pending_free: (0..pending as u16).rev().collect(),
                segment_free: (0..segments as u16).rev().collect(),
                waiters: Vec::new(),
            }),
            pending_capacity: pending,
            segment_capacity: segments,
        }
    }

    pub fn pending_capacity(&self) -> usize {
        self.pending_capacity
    }

    /// Total segment slots; a request needing more than this can never be
    /// satisfied and must be failed, not parked.
    pub fn segment_capacity(&self) -> usize {
        self.segment_capacity
    }

    /// Register a dispatcher doorbell for pool-free wakeups.
    pub fn subscribe(&self, bell: Doorbell) {
        self.inner.lock().waiters.push(bell);
    }

    /// Reserve one pending-request slot.
    pub fn alloc_pending(&self) -> Option<PendingId> {
        self.inner.lock().pending_free.pop().map(PendingId)
    }

    /// Return a pending slot that never carried a request (internal
    /// commands, empty-ring races).
    pub fn release_pending_unused(&self, id: PendingId) {
        let mut inner = self.inner.lock();
        let was_empty = inner.pending_free.is_empty();
        inner.pending_free.push(id.0);
        if was_empty {
            Self::wake(&inner);
        }
    }

    /// Reserve `count` segment slots, all or nothing.
    pub fn reserve_segments(&self, count: usize) -> Option<Vec<Segment>> {
        let mut inner = self.inner.lock();
        if inner.segment_free.len() < count {
            trace!(
                free = inner.segment_free.len(),
                need = count,
                "segment pool exhausted"
            );
            return None;
        }
        let at = inner.segment_free.len() - count;
        Some(
            inner
                .segment_free
                .drain(at..)
                .map(|id| Segment {
                    id: SegmentId(id),
                    mapped: None,
                })
                .collect(),
        )
    }

    /// Return segment slots whose mappings were already released.
    pub fn release_segments(&self, segments: &mut Vec<Segment>) {
        if segments.is_empty() {
            return;
        }
        let mut inner = self.inner.lock();
        let was_empty = inner.segment_free.is_empty();
        for seg in segments.drain(..) {
            debug_assert!(seg.mapped.is_none(), "releasing a still-mapped segment");
            inner.segment_free.push(seg.id.0);
        }
        if was_empty {
            Self::wake(&inner);
        }
    }

    /// Free a completed pending request: its segment slots and then the
    /// request slot itself. Run by the reaper, never by the completion
    /// callback.
    pub fn free(&self, mut preq: PendingRequest) {
        let mut inner = self.inner.lock();
        let was_empty =
            inner.pending_free.is_empty() || inner.segment_free.is_empty();

        for seg in preq
            .segments
            .drain(..)
            .chain(preq.indirect_segments.drain(..))
        {
            debug_assert!(seg.mapped.is_none(), "freeing a still-mapped segment");
            inner.segment_free.push(seg.id.0);
        }
        inner.pending_free.push(preq.pending_id.0);

        if was_empty {
            Self::wake(&inner);
        }
    }

    /// Free slot counts, for diagnostics and tests.
    pub fn free_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.pending_free.len(), inner.segment_free.len())
    }

    fn wake(inner: &PoolsInner) {
        for bell in &inner.waiters {
            bell.signal();
        }
    }
}
