//! Memory grants
//!
//! A grant is a revocable capability letting the peer map one page for
//! direct access. The granting side owns the page until it revokes the
//! grant; revoking while the peer still has the page mapped is a local
//! ordering bug (completion ordering is supposed to prevent it) and
//! panics rather than racing the peer's access.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

use crate::page::Page;
use protocol::GrantRef;

/// Access the peer is allowed on a granted page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantAccess {
    /// Peer may only read (OUT data).
    ReadOnly,
    /// Peer may read and write (IN data, descriptor tables it completes).
    ReadWrite,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GrantError {
    /// No grant references left; retryable backpressure, never fatal.
    #[error("grant table exhausted")]
    Exhausted,

    /// Reference unknown or already revoked.
    #[error("grant reference {0} not found")]
    NotFound(u32),

    /// Write mapping requested on a read-only grant.
    #[error("write access denied for grant reference {0}")]
    AccessDenied(u32),
}

struct Entry {
    page: Arc<Page>,
    readonly: bool,
    mapped: u32,
}

struct TableInner {
    entries: HashMap<u32, Entry>,
    next_ref: u32,
    capacity: Option<usize>,
}

/// The grant table shared by the two ends of one link
///
/// Models the per-connection slice of a real grant mechanism: establish
/// and revoke on the granting side, map and unmap on the peer side.
pub struct GrantTable {
    inner: Mutex<TableInner>,
}

impl GrantTable {
    pub fn new() -> GrantTable {
        GrantTable {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                next_ref: 1,
                capacity: None,
            }),
        }
    }

    /// A table refusing to hold more than `capacity` live grants, for
    /// exercising exhaustion backpressure.
    pub fn with_capacity(capacity: usize) -> GrantTable {
        let mut table = GrantTable::new();
        table.inner.get_mut().capacity = Some(capacity);
        table
    }

    /// Expose `page` to the peer and return the reference to put on the
    /// wire.
    pub fn establish(
        &self,
        page: Arc<Page>,
        access: GrantAccess,
    ) -> Result<GrantRef, GrantError> {
        let mut inner = self.inner.lock();
        if let Some(cap) = inner.capacity {
            if inner.entries.len() >= cap {
                return Err(GrantError::Exhausted);
            }
        }

        let gref = inner.next_ref;
        inner.next_ref = inner.next_ref.checked_add(1).expect("grant refs exhausted");
        inner.entries.insert(
            gref,
            Entry {
                page,
                readonly: access == GrantAccess::ReadOnly,
                mapped: 0,
            },
        );
        trace!(gref, ?access, "grant established");
        Ok(GrantRef(gref))
    }

    /// Withdraw a grant and reclaim the page.
    ///
    /// # Panics
    ///
    /// Panics if the reference is unknown or the peer still has it mapped;
    /// both are local invariant violations.
    pub fn revoke(&self, gref: GrantRef) -> Arc<Page> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .remove(&gref.0)
            .unwrap_or_else(|| panic!("revoking unknown grant reference {}", gref.0));
        assert!(
            entry.mapped == 0,
            "revoking grant reference {} while still mapped",
            gref.0
        );
        trace!(gref = gref.0, "grant revoked");
        entry.page
    }

    /// Map a peer-granted page for direct access.
    ///
    /// Failure aborts only the request being served; the reference may be
    /// bogus or revoked remote input.
    pub fn map(&self, gref: GrantRef, write: bool) -> Result<MappedGrant, GrantError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(&gref.0)
            .ok_or(GrantError::NotFound(gref.0))?;
        if write && entry.readonly {
            return Err(GrantError::AccessDenied(gref.0));
        }

        entry.mapped += 1;
        Ok(MappedGrant {
            gref,
            page: Arc::clone(&entry.page),
            write,
        })
    }

    /// Release a mapping made with [`GrantTable::map`].
    pub fn unmap(&self, mapped: MappedGrant) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(&mapped.gref.0) {
            debug_assert!(entry.mapped > 0);
            entry.mapped = entry.mapped.saturating_sub(1);
        }
        // A missing entry means the granter revoked while we were mapped;
        // that side has already panicked on its own invariant.
    }

    /// Number of live grants (diagnostics and tests).
    pub fn outstanding(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl Default for GrantTable {
    fn default() -> Self {
        GrantTable::new()
    }
}

/// A peer page mapped through the grant table
///
/// Holds the page alive until explicitly unmapped; dropping it without
/// unmapping leaks the map count and will trip the revoke assertion,
/// which is exactly where a forgotten unmap should surface.
pub struct MappedGrant {
    gref: GrantRef,
    page: Arc<Page>,
    write: bool,
}

impl MappedGrant {
    pub fn gref(&self) -> GrantRef {
        self.gref
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn writable(&self) -> bool {
        self.write
    }
}

impl std::fmt::Debug for MappedGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedGrant")
            .field("gref", &self.gref.0)
            .field("write", &self.write)
            .finish()
    }
}
