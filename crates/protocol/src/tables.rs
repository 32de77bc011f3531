//! Page-table encodings
//!
//! Two little-endian table layouts live inside granted pages rather than in
//! ring slots: indirect descriptor tables (extra grant references when a
//! transfer exceeds the direct segment ceiling) and isochronous packet
//! tables (per-packet offset/length/status). The reading side is always
//! the untrusted peer's data, so both readers validate counts.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ProtocolError, Result};
use crate::status::TransferStatus;
use crate::types::GrantRef;
use crate::{ISO_PACKET_BYTES, MAX_ISO_PACKETS, MAX_SEGMENTS_PER_PAGE, PAGE_SIZE};

/// One isochronous packet descriptor
///
/// On submission `offset` and `length` describe the packet's slice of the
/// transfer buffer; on completion the backend fills in `status` and the
/// actual `length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u16,
    pub status: i16,
}

impl IsoPacket {
    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_wire(self.status)
    }
}

/// Serialize an isochronous packet table into a page buffer.
///
/// # Panics
///
/// Panics if there are more packets than one page can hold; callers bound
/// `nr_packets` before building the table.
pub fn write_iso_table(packets: &[IsoPacket], page: &mut [u8]) {
    assert!(packets.len() <= MAX_ISO_PACKETS, "iso packet table overflow");
    assert!(page.len() >= packets.len() * ISO_PACKET_BYTES);

    for (i, packet) in packets.iter().enumerate() {
        let at = i * ISO_PACKET_BYTES;
        LittleEndian::write_u32(&mut page[at..at + 4], packet.offset);
        LittleEndian::write_u16(&mut page[at + 4..at + 6], packet.length);
        LittleEndian::write_i16(&mut page[at + 6..at + 8], packet.status);
    }
}

/// Read `count` isochronous packet descriptors back out of a page buffer.
pub fn read_iso_table(page: &[u8], count: usize) -> Result<Vec<IsoPacket>> {
    if count > MAX_ISO_PACKETS || count * ISO_PACKET_BYTES > page.len() {
        return Err(ProtocolError::IsoTableOverflow { count });
    }

    let mut packets = Vec::with_capacity(count);
    for i in 0..count {
        let at = i * ISO_PACKET_BYTES;
        packets.push(IsoPacket {
            offset: LittleEndian::read_u32(&page[at..at + 4]),
            length: LittleEndian::read_u16(&page[at + 4..at + 6]),
            status: LittleEndian::read_i16(&page[at + 6..at + 8]),
        });
    }
    Ok(packets)
}

/// Serialize an indirect descriptor table: a u32 segment count followed by
/// that many grant references.
///
/// # Panics
///
/// Panics if `refs` exceeds the per-page ceiling.
pub fn write_indirect_table(refs: &[GrantRef], page: &mut [u8]) {
    assert!(
        refs.len() <= MAX_SEGMENTS_PER_PAGE,
        "indirect descriptor table overflow"
    );
    assert!(page.len() >= PAGE_SIZE);

    LittleEndian::write_u32(&mut page[0..4], refs.len() as u32);
    for (i, gref) in refs.iter().enumerate() {
        let at = 4 + i * 4;
        LittleEndian::write_u32(&mut page[at..at + 4], gref.0);
    }
}

/// Read an indirect descriptor table out of a mapped peer page.
///
/// A zero or oversized segment count is malformed remote input and is
/// rejected, never trusted.
pub fn read_indirect_table(page: &[u8]) -> Result<Vec<GrantRef>> {
    if page.len() < 4 {
        return Err(ProtocolError::IndirectTableOverflow { count: 0 });
    }

    let count = LittleEndian::read_u32(&page[0..4]) as usize;
    if count == 0 || count > MAX_SEGMENTS_PER_PAGE || 4 + count * 4 > page.len() {
        return Err(ProtocolError::IndirectTableOverflow { count });
    }

    let mut refs = Vec::with_capacity(count);
    for i in 0..count {
        let at = 4 + i * 4;
        refs.push(GrantRef(LittleEndian::read_u32(&page[at..at + 4])));
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso_table_roundtrip() {
        let packets: Vec<IsoPacket> = (0..8)
            .map(|i| IsoPacket {
                offset: i * 188,
                length: 188,
                status: 0,
            })
            .collect();

        let mut page = vec![0u8; PAGE_SIZE];
        write_iso_table(&packets, &mut page);
        let back = read_iso_table(&page, packets.len()).unwrap();
        assert_eq!(back, packets);
    }

    #[test]
    fn iso_table_rejects_oversized_count() {
        let page = vec![0u8; PAGE_SIZE];
        assert!(read_iso_table(&page, MAX_ISO_PACKETS + 1).is_err());
    }

    #[test]
    fn indirect_table_roundtrip() {
        let refs: Vec<GrantRef> = (1..=100).map(GrantRef).collect();
        let mut page = vec![0u8; PAGE_SIZE];
        write_indirect_table(&refs, &mut page);
        assert_eq!(read_indirect_table(&page).unwrap(), refs);
    }

    #[test]
    fn indirect_table_rejects_bad_counts() {
        let mut page = vec![0u8; PAGE_SIZE];
        // Zero segments.
        LittleEndian::write_u32(&mut page[0..4], 0);
        assert!(read_indirect_table(&page).is_err());

        // Count past the per-page ceiling.
        LittleEndian::write_u32(&mut page[0..4], (MAX_SEGMENTS_PER_PAGE + 1) as u32);
        assert!(read_indirect_table(&page).is_err());
    }
}
