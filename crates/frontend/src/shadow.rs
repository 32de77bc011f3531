//! Shadow slot pool
//!
//! One shadow per ring slot, binding an in-flight transfer to the ring id
//! it was submitted under and owning everything that must be reclaimed
//! when the response arrives: granted references and indirect descriptor
//! pages. Slot ids are assigned once at construction and never change;
//! the pool is a fixed arena with a free-list of indices.
//!
//! Conservation invariant: `free + in_use == RING_CAPACITY` always. Any
//! deviation is a local bug and panics.

use std::sync::Arc;

use common::Page;
use protocol::{FLAG_DIRECT_DATA, GrantRef, RING_CAPACITY, RingRequest, TransferId};

pub(crate) struct Shadow {
    /// The request as sent; `req.id` is this slot's permanent identity.
    pub req: RingRequest,
    /// Owning transfer, `None` for internal commands.
    pub transfer: Option<TransferId>,
    /// Granted isochronous packet-table page.
    pub iso_page: Option<Arc<Page>>,
    /// Indirect descriptor pages, held until release.
    pub indirect_pages: Vec<Arc<Page>>,
    /// Every grant reference to revoke on release.
    pub grefs: Vec<GrantRef>,
    pub in_use: bool,
}

/// What a released shadow hands back for revocation
pub(crate) struct ShadowRelease {
    pub grefs: Vec<GrantRef>,
    /// Inline-data requests granted nothing.
    pub direct_data: bool,
}

pub(crate) struct ShadowPool {
    shadows: Vec<Shadow>,
    free_list: Vec<u16>,
}

impl ShadowPool {
    pub fn new() -> ShadowPool {
        let shadows = (0..RING_CAPACITY)
            .map(|i| Shadow {
                req: RingRequest::empty(i as u64),
                transfer: None,
                iso_page: None,
                indirect_pages: Vec::new(),
                grefs: Vec::new(),
                in_use: false,
            })
            .collect();
        ShadowPool {
            shadows,
            free_list: (0..RING_CAPACITY as u16).collect(),
        }
    }

    pub fn free(&self) -> usize {
        self.free_list.len()
    }

    pub fn in_use(&self) -> usize {
        RING_CAPACITY - self.free_list.len()
    }

    /// Claim a slot; fields are reset but the slot id is preserved.
    pub fn get(&mut self) -> Option<u16> {
        let idx = self.free_list.pop()?;
        let shadow = &mut self.shadows[idx as usize];
        assert!(!shadow.in_use, "claiming shadow {} already in use", idx);

        shadow.req = RingRequest::empty(idx as u64);
        shadow.transfer = None;
        shadow.iso_page = None;
        shadow.indirect_pages.clear();
        shadow.grefs.clear();
        shadow.in_use = true;
        Some(idx)
    }

    pub fn at(&self, id: u64) -> &Shadow {
        let shadow = &self.shadows[id as usize];
        assert!(shadow.in_use, "touching free shadow {}", id);
        shadow
    }

    pub fn at_mut(&mut self, id: u64) -> &mut Shadow {
        let shadow = &mut self.shadows[id as usize];
        assert!(shadow.in_use, "touching free shadow {}", id);
        shadow
    }

    /// Release a slot back to the free list, detaching everything the
    /// caller must revoke or drop.
    pub fn put(&mut self, id: u64) -> ShadowRelease {
        let shadow = &mut self.shadows[id as usize];
        assert!(shadow.in_use, "releasing shadow {} not in use", id);

        let release = ShadowRelease {
            grefs: std::mem::take(&mut shadow.grefs),
            direct_data: shadow.req.has_flag(FLAG_DIRECT_DATA),
        };
        shadow.iso_page = None;
        shadow.indirect_pages.clear();
        shadow.transfer = None;
        shadow.in_use = false;

        assert!(
            self.free_list.len() < RING_CAPACITY,
            "shadow free list overflow"
        );
        self.free_list.push(id as u16);
        release
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_holds_through_churn() {
        let mut pool = ShadowPool::new();
        assert_eq!(pool.free() + pool.in_use(), RING_CAPACITY);

        let mut claimed = Vec::new();
        for _ in 0..RING_CAPACITY {
            claimed.push(pool.get().unwrap());
            assert_eq!(pool.free() + pool.in_use(), RING_CAPACITY);
        }
        assert!(pool.get().is_none());

        for id in claimed {
            pool.put(id as u64);
            assert_eq!(pool.free() + pool.in_use(), RING_CAPACITY);
        }
        assert_eq!(pool.free(), RING_CAPACITY);
    }

    #[test]
    fn slot_identity_is_stable() {
        let mut pool = ShadowPool::new();
        let idx = pool.get().unwrap();
        assert_eq!(pool.at(idx as u64).req.id, idx as u64);
        pool.put(idx as u64);

        let again = pool.get().unwrap();
        assert_eq!(pool.at(again as u64).req.id, again as u64);
    }

    #[test]
    #[should_panic(expected = "not in use")]
    fn double_release_panics() {
        let mut pool = ShadowPool::new();
        let idx = pool.get().unwrap();
        pool.put(idx as u64);
        pool.put(idx as u64);
    }
}
