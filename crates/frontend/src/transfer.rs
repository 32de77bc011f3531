//! Transfer requests
//!
//! The logical USB operation the controller's caller hands to `enqueue`
//! and receives back, completed, on the event channel. The buffer is
//! page-backed so its pages can be granted to the backend without copying
//! through the control channel.

use std::sync::Arc;

use common::Page;
use protocol::{
    ENDPOINT_DIR_IN, IsoPacket, PAGE_SIZE, SetupPacket, TransferId, TransferKind, TransferStatus,
    span_pages,
};

/// Lifecycle of one transfer inside the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, not yet on the ring.
    New,
    /// Submitted; a response will arrive.
    Sent,
    /// Response applied; terminal.
    Done,
    /// Failed or abandoned before a response; terminal.
    Dropped,
    /// Cancel requested while sent; resolves to Done via the response
    /// path, carrying the status recorded at cancel time.
    Cancel,
}

/// Page-backed transfer data
#[derive(Debug)]
pub struct TransferBuffer {
    pages: Vec<Arc<Page>>,
    offset: u32,
    len: u32,
}

impl TransferBuffer {
    pub fn empty() -> TransferBuffer {
        TransferBuffer {
            pages: Vec::new(),
            offset: 0,
            len: 0,
        }
    }

    /// Zeroed buffer for IN transfers.
    pub fn for_input(len: usize) -> TransferBuffer {
        let pages = (0..span_pages(0, len)).map(|_| Page::new()).collect();
        TransferBuffer {
            pages,
            offset: 0,
            len: len as u32,
        }
    }

    /// Buffer holding a copy of `data`, for OUT transfers.
    pub fn from_slice(data: &[u8]) -> TransferBuffer {
        let buf = TransferBuffer::for_input(data.len());
        buf.write_bytes(0, data);
        buf
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    /// Pages the buffer spans.
    pub fn page_count(&self) -> usize {
        span_pages(self.offset as usize, self.len as usize)
    }

    /// Copy of the buffer contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read_bytes(0, self.len())
    }

    pub(crate) fn read_bytes(&self, at: usize, len: usize) -> Vec<u8> {
        assert!(at + len <= self.len());
        let mut out = vec![0u8; len];
        let mut done = 0;
        let mut skip = self.offset as usize + at;
        for page in &self.pages {
            if skip >= PAGE_SIZE {
                skip -= PAGE_SIZE;
                continue;
            }
            let take = (len - done).min(PAGE_SIZE - skip);
            page.read(skip, &mut out[done..done + take]);
            done += take;
            skip = 0;
            if done == len {
                break;
            }
        }
        out
    }

    pub(crate) fn write_bytes(&self, at: usize, data: &[u8]) {
        assert!(at + data.len() <= self.len());
        let mut done = 0;
        let mut skip = self.offset as usize + at;
        for page in &self.pages {
            if skip >= PAGE_SIZE {
                skip -= PAGE_SIZE;
                continue;
            }
            let take = (data.len() - done).min(PAGE_SIZE - skip);
            page.write(skip, &data[done..done + take]);
            done += take;
            skip = 0;
            if done == data.len() {
                break;
            }
        }
    }
}

/// One logical USB operation
#[derive(Debug)]
pub struct TransferRequest {
    pub id: TransferId,
    pub kind: TransferKind,
    /// Endpoint address including the direction bit.
    pub endpoint: u8,
    pub setup: Option<SetupPacket>,
    /// Allow a short IN completion without error.
    pub short_ok: bool,
    pub buffer: TransferBuffer,
    /// Submitted packet layout; statuses and actual lengths are filled in
    /// on completion.
    pub iso_packets: Vec<IsoPacket>,
    pub iso_asap: bool,
    pub start_frame: u32,
    /// Completion results.
    pub status: TransferStatus,
    pub actual_length: u32,
    pub error_count: u32,
}

impl TransferRequest {
    fn new(id: TransferId, kind: TransferKind, endpoint: u8, buffer: TransferBuffer) -> Self {
        TransferRequest {
            id,
            kind,
            endpoint,
            setup: None,
            short_ok: false,
            buffer,
            iso_packets: Vec::new(),
            iso_asap: false,
            start_frame: 0,
            status: TransferStatus::Pending,
            actual_length: 0,
            error_count: 0,
        }
    }

    /// Control transfer; direction comes from the setup packet.
    pub fn control(id: TransferId, setup: SetupPacket, buffer: TransferBuffer) -> Self {
        let endpoint = if setup.is_dir_in() { ENDPOINT_DIR_IN } else { 0 };
        let mut t = TransferRequest::new(id, TransferKind::Control, endpoint, buffer);
        t.setup = Some(setup);
        t
    }

    pub fn bulk_out(id: TransferId, endpoint: u8, data: &[u8]) -> Self {
        TransferRequest::new(
            id,
            TransferKind::Bulk,
            endpoint & !ENDPOINT_DIR_IN,
            TransferBuffer::from_slice(data),
        )
    }

    pub fn bulk_in(id: TransferId, endpoint: u8, len: usize) -> Self {
        let mut t = TransferRequest::new(
            id,
            TransferKind::Bulk,
            endpoint | ENDPOINT_DIR_IN,
            TransferBuffer::for_input(len),
        );
        t.short_ok = true;
        t
    }

    pub fn interrupt_out(id: TransferId, endpoint: u8, data: &[u8]) -> Self {
        TransferRequest::new(
            id,
            TransferKind::Interrupt,
            endpoint & !ENDPOINT_DIR_IN,
            TransferBuffer::from_slice(data),
        )
    }

    pub fn interrupt_in(id: TransferId, endpoint: u8, len: usize) -> Self {
        let mut t = TransferRequest::new(
            id,
            TransferKind::Interrupt,
            endpoint | ENDPOINT_DIR_IN,
            TransferBuffer::for_input(len),
        );
        t.short_ok = true;
        t
    }

    /// Isochronous transfer over equal-sized packets.
    pub fn isochronous_out(
        id: TransferId,
        endpoint: u8,
        data: &[u8],
        packet_len: usize,
    ) -> Self {
        let mut t = TransferRequest::new(
            id,
            TransferKind::Isochronous,
            endpoint & !ENDPOINT_DIR_IN,
            TransferBuffer::from_slice(data),
        );
        t.iso_packets = packetize(data.len(), packet_len);
        t.iso_asap = true;
        t
    }

    pub fn isochronous_in(id: TransferId, endpoint: u8, len: usize, packet_len: usize) -> Self {
        let mut t = TransferRequest::new(
            id,
            TransferKind::Isochronous,
            endpoint | ENDPOINT_DIR_IN,
            TransferBuffer::for_input(len),
        );
        t.iso_packets = packetize(len, packet_len);
        t.iso_asap = true;
        t.short_ok = true;
        t
    }

    pub fn is_dir_in(&self) -> bool {
        match self.setup {
            Some(setup) => setup.is_dir_in(),
            None => self.endpoint & ENDPOINT_DIR_IN != 0,
        }
    }

    /// The completed data (IN transfers).
    pub fn data(&self) -> Vec<u8> {
        self.buffer
            .read_bytes(0, (self.actual_length as usize).min(self.buffer.len()))
    }
}

fn packetize(total: usize, packet_len: usize) -> Vec<IsoPacket> {
    assert!(packet_len > 0);
    let mut packets = Vec::new();
    let mut at = 0;
    while at < total {
        let len = packet_len.min(total - at);
        packets.push(IsoPacket {
            offset: at as u32,
            length: len as u16,
            status: 0,
        });
        at += len;
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_roundtrip_across_pages() {
        let data: Vec<u8> = (0..PAGE_SIZE * 2 + 17).map(|i| (i % 256) as u8).collect();
        let buf = TransferBuffer::from_slice(&data);
        assert_eq!(buf.page_count(), 3);
        assert_eq!(buf.to_vec(), data);
    }

    #[test]
    fn control_direction_follows_setup() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: 6,
            value: 0x0100,
            index: 0,
            length: 18,
        };
        let t = TransferRequest::control(TransferId(1), setup, TransferBuffer::for_input(18));
        assert!(t.is_dir_in());

        let setup = SetupPacket {
            request_type: 0x00,
            request: 5,
            value: 4,
            index: 0,
            length: 0,
        };
        let t = TransferRequest::control(TransferId(2), setup, TransferBuffer::empty());
        assert!(!t.is_dir_in());
    }

    #[test]
    fn packetize_covers_the_buffer() {
        let packets = packetize(1000, 300);
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[3].offset, 900);
        assert_eq!(packets[3].length, 100);
        let total: usize = packets.iter().map(|p| p.length as usize).sum();
        assert_eq!(total, 1000);
    }
}
