//! Test utilities shared across crates
//!
//! Helpers for building patterned payloads and page sets in transport
//! tests.

use std::sync::Arc;

use crate::grants::{GrantAccess, GrantTable};
use crate::page::Page;
use protocol::{GrantRef, PAGE_SIZE};

/// Deterministic byte pattern for payload verification.
pub fn pattern_bytes(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

/// Spread `data` over freshly allocated pages, `offset` bytes into the
/// first page, returning the pages.
pub fn pages_holding(data: &[u8], offset: usize) -> Vec<Arc<Page>> {
    assert!(offset < PAGE_SIZE);
    let total = offset + data.len();
    let count = total.div_ceil(PAGE_SIZE).max(1);

    let pages: Vec<Arc<Page>> = (0..count).map(|_| Page::new()).collect();
    let mut written = 0;
    let mut at = offset;
    for page in &pages {
        let take = (data.len() - written).min(PAGE_SIZE - at);
        page.write(at, &data[written..written + take]);
        written += take;
        at = 0;
        if written == data.len() {
            break;
        }
    }
    pages
}

/// Read `len` bytes back out of a page set starting at `offset`.
pub fn bytes_from_pages(pages: &[Arc<Page>], offset: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    let mut read = 0;
    let mut at = offset;
    for page in pages {
        let take = (len - read).min(PAGE_SIZE - at);
        page.read(at, &mut out[read..read + take]);
        read += take;
        at = 0;
        if read == len {
            break;
        }
    }
    assert_eq!(read, len, "page set shorter than requested read");
    out
}

/// Grant every page in order and return the references.
pub fn grant_all(
    table: &GrantTable,
    pages: &[Arc<Page>],
    access: GrantAccess,
) -> Vec<GrantRef> {
    pages
        .iter()
        .map(|p| table.establish(Arc::clone(p), access).expect("grant"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_survives_page_spread() {
        let data = pattern_bytes(7, 3 * PAGE_SIZE + 100);
        let pages = pages_holding(&data, 64);
        assert_eq!(pages.len(), 4);
        assert_eq!(bytes_from_pages(&pages, 64, data.len()), data);
    }

    #[test]
    fn empty_payload_still_gets_a_page() {
        let pages = pages_holding(&[], 0);
        assert_eq!(pages.len(), 1);
    }
}
