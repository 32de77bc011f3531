//! Shared transport ring
//!
//! A fixed-capacity circular buffer of request and response slots with one
//! free-running producer counter per direction. Each producer counter is
//! written only by its owning side with a Release store; the opposite side
//! reads it with an Acquire load before trusting the slots it gates. The
//! consumer counters are private to their side and never shared.
//!
//! The frontend can never legitimately overrun the ring because a request
//! slot is only filled when a shadow slot was reserved, so overruns on the
//! producing side are assertions. On the consuming side the counters came
//! from the peer: the backend treats an overflow as a protocol violation
//! and reports it as an error instead of trusting it.
//!
//! Notification is unconditional: every produce is followed by a doorbell
//! signal by the caller. The ring deliberately carries no `*_event`
//! holdoff fields for suppressing notifications.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

use protocol::{RING_CAPACITY, RingRequest, RingResponse};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// The peer's producer index ran past what the ring can hold.
    #[error("ring overflow: producer {prod} consumer {cons}")]
    Overflow { prod: u32, cons: u32 },
}

const MASK: u32 = RING_CAPACITY as u32 - 1;

/// The shared ring memory
///
/// Slots are `UnsafeCell` because they are written lock-free by exactly
/// one side under the single-writer counter discipline above.
pub struct SharedRing {
    req: [UnsafeCell<RingRequest>; RING_CAPACITY],
    rsp: [UnsafeCell<RingResponse>; RING_CAPACITY],
    req_prod: AtomicU32,
    rsp_prod: AtomicU32,
}

// One writer per slot at any time, publication ordered through the
// producer counters.
unsafe impl Sync for SharedRing {}
unsafe impl Send for SharedRing {}

impl SharedRing {
    pub fn new() -> Arc<SharedRing> {
        Arc::new(SharedRing {
            req: std::array::from_fn(|_| UnsafeCell::new(RingRequest::empty(0))),
            rsp: std::array::from_fn(|_| UnsafeCell::new(RingResponse::default())),
            req_prod: AtomicU32::new(0),
            rsp_prod: AtomicU32::new(0),
        })
    }
}

/// Frontend half: produces requests, consumes responses
pub struct FrontRing {
    sring: Arc<SharedRing>,
    req_prod_pvt: u32,
    rsp_cons: u32,
}

impl FrontRing {
    pub fn new(sring: Arc<SharedRing>) -> FrontRing {
        FrontRing {
            sring,
            req_prod_pvt: 0,
            rsp_cons: 0,
        }
    }

    /// Requests produced but not yet answered.
    pub fn in_flight(&self) -> u32 {
        self.req_prod_pvt.wrapping_sub(self.rsp_cons)
    }

    /// Publish one request slot.
    ///
    /// # Panics
    ///
    /// Panics if the ring is full. Shadow-slot accounting guarantees a
    /// free slot before this is called, so a full ring here is a local
    /// invariant violation.
    pub fn produce_request(&mut self, req: RingRequest) {
        assert!(
            self.in_flight() < RING_CAPACITY as u32,
            "request ring full: producer {} consumer {}",
            self.req_prod_pvt,
            self.rsp_cons
        );

        let idx = (self.req_prod_pvt & MASK) as usize;
        // Slot is ours: the backend will not read it until the Release
        // store below, and its previous occupant was consumed.
        unsafe { *self.sring.req[idx].get() = req };

        self.req_prod_pvt = self.req_prod_pvt.wrapping_add(1);
        self.sring.req_prod.store(self.req_prod_pvt, Ordering::Release);
    }

    /// Take the next response if the backend has published one.
    ///
    /// # Panics
    ///
    /// Panics if the backend's producer index implies more responses than
    /// requests; the backend is the privileged side, so that is fatal
    /// locally.
    pub fn consume_response(&mut self) -> Option<RingResponse> {
        let prod = self.sring.rsp_prod.load(Ordering::Acquire);
        if prod == self.rsp_cons {
            return None;
        }

        let outstanding = prod.wrapping_sub(self.rsp_cons);
        assert!(
            outstanding <= self.in_flight(),
            "response ring overrun: producer {} consumer {}",
            prod,
            self.rsp_cons
        );

        let idx = (self.rsp_cons & MASK) as usize;
        let rsp = unsafe { *self.sring.rsp[idx].get() };
        self.rsp_cons = self.rsp_cons.wrapping_add(1);
        Some(rsp)
    }

    /// True once every produced request has had its response consumed.
    pub fn drained(&self) -> bool {
        self.req_prod_pvt == self.rsp_cons
            && self.sring.rsp_prod.load(Ordering::Acquire) == self.rsp_cons
    }
}

/// Backend half: consumes requests, produces responses
pub struct BackRing {
    sring: Arc<SharedRing>,
    rsp_prod_pvt: u32,
    req_cons: u32,
}

impl BackRing {
    pub fn new(sring: Arc<SharedRing>) -> BackRing {
        BackRing {
            sring,
            rsp_prod_pvt: 0,
            req_cons: 0,
        }
    }

    /// True if the frontend has published requests we have not consumed.
    pub fn has_unconsumed_requests(&self) -> bool {
        self.sring.req_prod.load(Ordering::Acquire) != self.req_cons
    }

    /// Take the next request.
    ///
    /// `Err` means the frontend's producer index is inconsistent with
    /// the ring capacity, a protocol violation that terminates the
    /// connection. Never a panic: the frontend is untrusted.
    pub fn consume_request(&mut self) -> Result<Option<RingRequest>, RingError> {
        let prod = self.sring.req_prod.load(Ordering::Acquire);
        if prod == self.req_cons {
            return Ok(None);
        }

        let pending = prod.wrapping_sub(self.req_cons);
        if pending > RING_CAPACITY as u32 {
            return Err(RingError::Overflow {
                prod,
                cons: self.req_cons,
            });
        }

        // A full window of consumed-but-unanswered requests: stop draining
        // until responses go out, otherwise response production would
        // overwrite slots the frontend has not seen yet.
        let unanswered = self.req_cons.wrapping_sub(self.rsp_prod_pvt);
        if unanswered >= RING_CAPACITY as u32 {
            return Ok(None);
        }

        let idx = (self.req_cons & MASK) as usize;
        let req = unsafe { *self.sring.req[idx].get() };
        self.req_cons = self.req_cons.wrapping_add(1);
        Ok(Some(req))
    }

    /// Publish one response slot.
    ///
    /// # Panics
    ///
    /// Panics if there is no consumed-but-unanswered request to respond
    /// to; producing in that state is a local bug.
    pub fn produce_response(&mut self, rsp: RingResponse) {
        let unanswered = self.req_cons.wrapping_sub(self.rsp_prod_pvt);
        assert!(
            unanswered > 0 && unanswered <= RING_CAPACITY as u32,
            "response without a consumed request: producer {} req consumer {}",
            self.rsp_prod_pvt,
            self.req_cons
        );

        let idx = (self.rsp_prod_pvt & MASK) as usize;
        unsafe { *self.sring.rsp[idx].get() = rsp };

        self.rsp_prod_pvt = self.rsp_prod_pvt.wrapping_add(1);
        self.sring.rsp_prod.store(self.rsp_prod_pvt, Ordering::Release);
    }
}
