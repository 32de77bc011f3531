//! Wire protocol for rust-pv-usb
//!
//! This crate defines the slot layout carried over the shared transport ring
//! between the guest-side virtual host controller and the host-side
//! dispatcher: request and response slots, transfer kinds, request flags,
//! status codes, and the little-endian page tables used by indirect and
//! isochronous transfers.
//!
//! Slots are plain `Copy` structures; they are published through shared
//! memory, never serialized onto a byte stream. Everything read from the
//! remote side is untrusted and must go through the validating accessors
//! (`RingRequest::kind()`, `TransferStatus::from_wire()`, the table
//! readers) before use.
//!
//! # Example
//!
//! ```
//! use protocol::{RingRequest, TransferKind, TransferStatus};
//!
//! let mut req = RingRequest::empty(3);
//! req.kind = TransferKind::Bulk as u8;
//! req.length = 512;
//!
//! assert_eq!(req.kind(), Some(TransferKind::Bulk));
//! assert_eq!(TransferStatus::from_wire(0), TransferStatus::Ok);
//! ```

pub mod error;
pub mod slots;
pub mod status;
pub mod tables;
pub mod types;

pub use error::{ProtocolError, Result};
pub use slots::{
    FLAG_ASAP, FLAG_CYCLE_PORT, FLAG_DIRECT_DATA, FLAG_INDIRECT, FLAG_RESET, FLAG_SHORT_OK,
    RingRequest, RingResponse,
};
pub use status::TransferStatus;
pub use tables::{
    IsoPacket, read_indirect_table, read_iso_table, write_indirect_table, write_iso_table,
};
pub use types::{
    DESC_DEVICE, DeviceId, DeviceSpeed, ENDPOINT_DIR_IN, ENDPOINT_NUMBER_MASK, GrantRef,
    REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS, SetupPacket, TransferId, TransferKind,
};

/// Size of one shared page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Number of request/response slots on the transport ring (power of two).
pub const RING_CAPACITY: usize = 32;

/// Maximum scatter/gather segments carried directly in one request slot.
pub const MAX_SEGMENTS_PER_REQUEST: usize = 17;

/// Direct segment ceiling for isochronous requests (one slot is taken by
/// the packet-table page).
pub const MAX_ISO_SEGMENTS: usize = MAX_SEGMENTS_PER_REQUEST - 1;

/// Grant references held by one indirect descriptor page.
pub const MAX_SEGMENTS_PER_PAGE: usize = 1023;

/// Maximum number of indirect descriptor pages per request.
pub const MAX_INDIRECT_PAGES: usize = MAX_SEGMENTS_PER_REQUEST;

/// Effective page ceiling for an indirect request.
pub const MAX_PAGES_PER_INDIRECT_REQUEST: usize = MAX_INDIRECT_PAGES * MAX_SEGMENTS_PER_PAGE;

/// Effective page ceiling for an indirect isochronous request.
pub const MAX_PAGES_PER_INDIRECT_ISO_REQUEST: usize = MAX_PAGES_PER_INDIRECT_REQUEST - 1;

/// Bytes of one serialized isochronous packet descriptor.
pub const ISO_PACKET_BYTES: usize = 8;

/// Isochronous packets per request, bounded by the one-page packet table.
pub const MAX_ISO_PACKETS: usize = PAGE_SIZE / ISO_PACKET_BYTES;

/// Upper bound on the byte length of a single transfer.
pub const MAX_TRANSFER_BYTES: u32 = 10 * 1024 * 1024;

/// Number of indirect descriptor pages needed to reference `pages` data pages.
pub fn indirect_pages_required(pages: usize) -> usize {
    debug_assert!(pages > 0);
    (pages - 1) / MAX_SEGMENTS_PER_PAGE + 1
}

/// Number of pages spanned by a buffer of `len` bytes starting at `offset`
/// within its first page.
pub fn span_pages(offset: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    (offset + len).div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_capacity_is_power_of_two() {
        assert!(RING_CAPACITY.is_power_of_two());
    }

    #[test]
    fn indirect_page_math() {
        assert_eq!(indirect_pages_required(1), 1);
        assert_eq!(indirect_pages_required(MAX_SEGMENTS_PER_PAGE), 1);
        assert_eq!(indirect_pages_required(MAX_SEGMENTS_PER_PAGE + 1), 2);
    }

    #[test]
    fn span_pages_accounts_for_first_page_offset() {
        assert_eq!(span_pages(0, 0), 0);
        assert_eq!(span_pages(0, 1), 1);
        assert_eq!(span_pages(0, PAGE_SIZE), 1);
        assert_eq!(span_pages(1, PAGE_SIZE), 2);
        assert_eq!(span_pages(100, 2 * PAGE_SIZE), 3);
    }

    #[test]
    fn iso_table_fits_one_page() {
        assert_eq!(MAX_ISO_PACKETS * ISO_PACKET_BYTES, PAGE_SIZE);
    }
}
