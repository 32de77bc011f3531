//! Shared page buffers
//!
//! A [`Page`] is one 4 KiB buffer that can be exposed across the isolation
//! boundary through the grant table. Accessors take the page lock for the
//! duration of one copy; nothing holds it across a blocking operation.

use parking_lot::RwLock;
use std::sync::Arc;

use protocol::PAGE_SIZE;

/// One shareable page of transfer data
pub struct Page {
    bytes: RwLock<Box<[u8]>>,
}

impl Page {
    /// Allocate a zeroed page.
    pub fn new() -> Arc<Page> {
        Arc::new(Page {
            bytes: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
        })
    }

    /// Copy `data` into the page starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the copy would run off the page; callers validate
    /// geometry before touching page contents.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "write past page end");
        self.bytes.write()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Copy page contents from `offset` into `out`.
    pub fn read(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= PAGE_SIZE, "read past page end");
        out.copy_from_slice(&self.bytes.read()[offset..offset + out.len()]);
    }

    /// Run `f` over the page contents read-locked.
    pub fn with_read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }

    /// Run `f` over the page contents write-locked.
    pub fn with_write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.bytes.write())
    }

    /// Copy of the whole page.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().to_vec()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").finish_non_exhaustive()
    }
}
