//! Link construction
//!
//! A link is everything one frontend device and one backend dispatcher
//! share: the ring, the grant table, and a doorbell per direction. The
//! connect/disconnect plumbing that hands links out is external; tests and
//! the sim build them directly.

use std::sync::Arc;

use crate::doorbell::{Doorbell, DoorbellWaiter, doorbell};
use crate::grants::GrantTable;
use crate::ring::{BackRing, FrontRing, SharedRing};

/// Frontend end of a link
pub struct FrontLink {
    /// Request producer / response consumer.
    pub ring: FrontRing,
    /// Grant table this side establishes grants in.
    pub grants: Arc<GrantTable>,
    /// Rings the backend after producing requests.
    pub notify: Doorbell,
    /// Woken when the backend produced responses.
    pub interrupt: DoorbellWaiter,
    /// Local handle on the interrupt doorbell, used to wake or shut down
    /// the notification handler from this side.
    pub interrupt_wake: Doorbell,
}

/// Backend end of a link
pub struct BackLink {
    /// Request consumer / response producer.
    pub ring: BackRing,
    /// Grant table this side maps grants from.
    pub grants: Arc<GrantTable>,
    /// Rings the frontend after producing responses.
    pub notify: Doorbell,
    /// Woken when the frontend produced requests.
    pub wakeup: DoorbellWaiter,
    /// Extra signal handle on `wakeup`, for pool-free and self-wake
    /// sources.
    pub wakeup_signal: Doorbell,
}

/// Builder for connected link pairs
pub struct Link;

impl Link {
    /// Create a connected frontend/backend pair with an unbounded grant
    /// table.
    pub fn new() -> (FrontLink, BackLink) {
        Link::with_grant_table(GrantTable::new())
    }

    /// Create a pair over a caller-configured grant table.
    pub fn with_grant_table(grants: GrantTable) -> (FrontLink, BackLink) {
        let sring = SharedRing::new();
        let grants = Arc::new(grants);
        let (front_bell, back_wait) = doorbell();
        let (back_bell, front_wait) = doorbell();

        let front = FrontLink {
            ring: FrontRing::new(Arc::clone(&sring)),
            grants: Arc::clone(&grants),
            notify: front_bell.clone(),
            interrupt: front_wait,
            interrupt_wake: back_bell.clone(),
        };
        let back = BackLink {
            ring: BackRing::new(sring),
            grants,
            notify: back_bell,
            wakeup: back_wait,
            wakeup_signal: front_bell,
        };
        (front, back)
    }
}
