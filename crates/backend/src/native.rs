//! Native USB stack interface
//!
//! The dispatcher issues transfer I/O against a [`NativeDevice`], the seam
//! to whatever actually executes USB operations. Completion is always
//! asynchronous through the submitted callback, which may run in any
//! context (including inline from `submit` on immediate failure), so the
//! callback must never block.
//!
//! [`NativeStatus`] is the native stack's own status domain; it maps onto
//! the wire enumeration through [`map_native_status`], with `Unknown` as
//! the only catch-all.

use std::sync::Arc;

use common::Page;
use protocol::{DeviceSpeed, PAGE_SIZE, SetupPacket, TransferKind, TransferStatus};

/// Completion status in the native stack's own domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeStatus {
    /// Completed successfully.
    Completed,
    /// Unlinked synchronously before completion.
    Unlinked,
    /// Still in progress.
    InProgress,
    /// Bit stuffing or other low-level protocol failure.
    BitStuff,
    /// CRC mismatch.
    Crc,
    /// Timed out.
    TimedOut,
    /// Endpoint stalled.
    Stalled,
    /// Communication error on an IN endpoint (buffer overrun).
    CommError,
    /// Out of resources on an OUT endpoint (buffer underrun).
    NoResources,
    /// Device returned more data than the buffer holds.
    Overflow,
    /// Short packet on a transfer that forbade it.
    ShortPacket,
    /// Device is gone.
    NoDevice,
    /// Some isochronous packets failed.
    PartialIso,
    /// Request was malformed at the native layer.
    InvalidArgument,
    /// Unlinked asynchronously.
    ConnectionReset,
    /// Device or endpoint shut down.
    Shutdown,
    /// Anything else, carrying the raw native code.
    Other(i32),
}

/// Map a native completion status onto the wire status enumeration.
pub fn map_native_status(status: NativeStatus) -> TransferStatus {
    match status {
        NativeStatus::Completed => TransferStatus::Ok,
        NativeStatus::Unlinked => TransferStatus::Canceled,
        NativeStatus::InProgress => TransferStatus::Pending,
        NativeStatus::BitStuff => TransferStatus::Protocol,
        NativeStatus::Crc => TransferStatus::Crc,
        NativeStatus::TimedOut => TransferStatus::Timeout,
        NativeStatus::Stalled => TransferStatus::Stalled,
        NativeStatus::CommError => TransferStatus::InBufferOverrun,
        NativeStatus::NoResources => TransferStatus::OutBufferUnderrun,
        NativeStatus::Overflow => TransferStatus::Overflow,
        NativeStatus::ShortPacket => TransferStatus::ShortPacket,
        NativeStatus::NoDevice => TransferStatus::DeviceRemoved,
        NativeStatus::PartialIso => TransferStatus::PartialIso,
        NativeStatus::InvalidArgument => TransferStatus::InvalidArgument,
        NativeStatus::ConnectionReset => TransferStatus::Reset,
        NativeStatus::Shutdown => TransferStatus::Shutdown,
        NativeStatus::Other(_) => TransferStatus::Unknown,
    }
}

/// Scatter view over mapped transfer pages
///
/// The zero-copy window the native stack reads OUT data from and writes IN
/// data into. `offset` applies to the first page only.
#[derive(Clone)]
pub struct ScatterBuffer {
    pages: Vec<Arc<Page>>,
    offset: usize,
    len: usize,
}

impl ScatterBuffer {
    pub fn new(pages: Vec<Arc<Page>>, offset: usize, len: usize) -> ScatterBuffer {
        debug_assert!(offset < PAGE_SIZE || (len == 0 && offset == 0));
        debug_assert!(pages.len() >= protocol::span_pages(offset, len));
        ScatterBuffer { pages, offset, len }
    }

    pub fn empty() -> ScatterBuffer {
        ScatterBuffer {
            pages: Vec::new(),
            offset: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy the whole window out.
    pub fn read_all(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        let mut done = 0;
        let mut at = self.offset;
        for page in &self.pages {
            if done == self.len {
                break;
            }
            let take = (self.len - done).min(PAGE_SIZE - at);
            page.read(at, &mut out[done..done + take]);
            done += take;
            at = 0;
        }
        debug_assert_eq!(done, self.len);
        out
    }

    /// Copy `data` into the window from the start; returns bytes written.
    pub fn write_all(&self, data: &[u8]) -> usize {
        let len = data.len().min(self.len);
        let mut done = 0;
        let mut at = self.offset;
        for page in &self.pages {
            if done == len {
                break;
            }
            let take = (len - done).min(PAGE_SIZE - at);
            page.write(at, &data[done..done + take]);
            done += take;
            at = 0;
        }
        len
    }

    /// Copy `data` into the window at byte `pos` (isochronous packets).
    pub fn write_at(&self, pos: usize, data: &[u8]) -> usize {
        let end = (pos + data.len()).min(self.len);
        if pos >= end {
            return 0;
        }
        let mut done = 0;
        let mut remaining_skip = self.offset + pos;
        for page in &self.pages {
            if remaining_skip >= PAGE_SIZE {
                remaining_skip -= PAGE_SIZE;
                continue;
            }
            let take = (end - pos - done).min(PAGE_SIZE - remaining_skip);
            page.write(remaining_skip, &data[done..done + take]);
            done += take;
            remaining_skip = 0;
            if done == end - pos {
                break;
            }
        }
        done
    }
}

/// Isochronous attachment to a native transfer
pub struct IsoTable {
    /// Mapped packet-table page; statuses and actual lengths are written
    /// back into it on completion.
    pub page: Arc<Page>,
    pub nr_packets: u16,
    pub start_frame: u32,
    pub asap: bool,
}

/// One native transfer built from a consumed ring request
pub struct Urb {
    /// Ring request id, echoed in the response and used for unlinking.
    pub id: u64,
    pub kind: TransferKind,
    pub endpoint: u8,
    pub dir_in: bool,
    pub setup: Option<SetupPacket>,
    pub short_ok: bool,
    pub buffer: ScatterBuffer,
    pub iso: Option<IsoTable>,
}

/// Completion result delivered by the native stack
#[derive(Debug, Clone, Copy)]
pub struct UrbResult {
    pub status: NativeStatus,
    pub actual_length: u32,
    /// Frame the transfer started on (isochronous / frame queries).
    pub start_frame: u32,
}

impl UrbResult {
    pub fn error(status: NativeStatus) -> UrbResult {
        UrbResult {
            status,
            actual_length: 0,
            start_frame: 0,
        }
    }
}

/// Callback invoked exactly once when a submitted URB completes.
pub type UrbCompletion = Box<dyn FnOnce(UrbResult) + Send>;

/// The native USB stack seam
///
/// `submit` never fails synchronously: submission errors are reported by
/// invoking the completion inline with an error status.
pub trait NativeDevice: Send + Sync {
    /// Queue a transfer; `done` fires exactly once from any context.
    fn submit(&self, urb: Urb, done: UrbCompletion);

    /// Best-effort unlink of an in-flight transfer by ring id. The victim
    /// still completes through its callback, with an unlinked status.
    fn unlink(&self, id: u64) -> bool;

    /// Reset the device.
    fn reset(&self) -> Result<(), NativeStatus>;

    /// Force re-enumeration.
    fn cycle_port(&self);

    /// Abort everything queued on one endpoint.
    fn abort_endpoint(&self, endpoint: u8) -> Result<(), NativeStatus>;

    /// Current frame number.
    fn current_frame(&self) -> Result<u32, NativeStatus>;

    /// Negotiated device speed.
    fn speed(&self) -> DeviceSpeed;

    /// Kill every in-flight transfer; used on teardown.
    fn flush(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{pages_holding, pattern_bytes};

    #[test]
    fn every_native_status_maps_to_exactly_one_wire_status() {
        let natives = [
            NativeStatus::Completed,
            NativeStatus::Unlinked,
            NativeStatus::InProgress,
            NativeStatus::BitStuff,
            NativeStatus::Crc,
            NativeStatus::TimedOut,
            NativeStatus::Stalled,
            NativeStatus::CommError,
            NativeStatus::NoResources,
            NativeStatus::Overflow,
            NativeStatus::ShortPacket,
            NativeStatus::NoDevice,
            NativeStatus::PartialIso,
            NativeStatus::InvalidArgument,
            NativeStatus::ConnectionReset,
            NativeStatus::Shutdown,
        ];

        // Distinct wire statuses for every recognized native status.
        let mapped: Vec<TransferStatus> = natives.iter().map(|&s| map_native_status(s)).collect();
        for (i, a) in mapped.iter().enumerate() {
            for b in &mapped[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(!mapped.contains(&TransferStatus::Unknown));

        // Unknown is the sole catch-all.
        assert_eq!(map_native_status(NativeStatus::Other(-99)), TransferStatus::Unknown);
        assert_eq!(map_native_status(NativeStatus::Other(12)), TransferStatus::Unknown);
    }

    #[test]
    fn scatter_roundtrip_with_offset() {
        let data = pattern_bytes(3, PAGE_SIZE + 700);
        let pages = pages_holding(&data, 128);
        let buf = ScatterBuffer::new(pages, 128, data.len());
        assert_eq!(buf.read_all(), data);
    }

    #[test]
    fn scatter_write_at_lands_mid_buffer() {
        let pages = pages_holding(&vec![0u8; 2 * PAGE_SIZE], 0);
        let buf = ScatterBuffer::new(pages, 0, 2 * PAGE_SIZE);

        let chunk = pattern_bytes(9, 300);
        // Straddles the page boundary.
        assert_eq!(buf.write_at(PAGE_SIZE - 100, &chunk), 300);

        let all = buf.read_all();
        assert_eq!(&all[PAGE_SIZE - 100..PAGE_SIZE + 200], &chunk[..]);
    }

    #[test]
    fn scatter_write_truncates_at_window_end() {
        let pages = pages_holding(&vec![0u8; 16], 0);
        let buf = ScatterBuffer::new(pages, 0, 16);
        assert_eq!(buf.write_all(&[1u8; 32]), 16);
    }
}
