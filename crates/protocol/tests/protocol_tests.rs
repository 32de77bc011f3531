//! Integration tests for the wire protocol
//!
//! Exercises slot helpers, status mapping and the page-table encodings the
//! way the two transport sides use them.

use protocol::{
    FLAG_DIRECT_DATA, FLAG_INDIRECT, GrantRef, IsoPacket, MAX_SEGMENTS_PER_PAGE, PAGE_SIZE,
    RingRequest, RingResponse, SetupPacket, TransferKind, TransferStatus, read_indirect_table,
    read_iso_table, write_indirect_table, write_iso_table,
};

fn make_bulk_request(id: u64, segments: u8) -> RingRequest {
    let mut req = RingRequest::empty(id);
    req.kind = TransferKind::Bulk as u8;
    req.endpoint = 0x02;
    req.length = segments as u32 * PAGE_SIZE as u32;
    req.nr_segments = segments;
    for i in 0..segments as usize {
        req.segments[i] = GrantRef(i as u32 + 1);
    }
    req
}

#[test]
fn cancel_command_carries_target_id_inline() {
    let mut req = RingRequest::empty(31);
    req.kind = TransferKind::Cancel as u8;
    req.flags = FLAG_DIRECT_DATA;
    req.set_inline_data(17);

    assert_eq!(req.kind(), Some(TransferKind::Cancel));
    assert!(req.has_flag(FLAG_DIRECT_DATA));
    assert_eq!(req.inline_data(), 17);
}

#[test]
fn bulk_request_geometry() {
    let req = make_bulk_request(4, 5);
    assert_eq!(req.kind(), Some(TransferKind::Bulk));
    assert!(!req.is_dir_in());
    assert!(!req.is_indirect());
    assert_eq!(req.nr_segments, 5);
    assert!(req.segments[..5].iter().all(|g| g.is_valid()));
}

#[test]
fn indirect_flag_is_independent_of_kind() {
    let mut req = make_bulk_request(0, 2);
    req.flags |= FLAG_INDIRECT;
    assert!(req.is_indirect());
    assert_eq!(req.kind(), Some(TransferKind::Bulk));
}

#[test]
fn setup_packet_travels_through_slot() {
    let setup = SetupPacket {
        request_type: 0x21,
        request: 0x09,
        value: 0x0200,
        index: 1,
        length: 64,
    };

    let mut req = RingRequest::empty(0);
    req.kind = TransferKind::Control as u8;
    req.setup = setup.pack();

    assert_eq!(req.setup_packet(), setup);
    assert!(!req.setup_packet().is_dir_in());
}

#[test]
fn response_roundtrips_status() {
    for status in [
        TransferStatus::Ok,
        TransferStatus::Stalled,
        TransferStatus::DeviceRemoved,
        TransferStatus::Shutdown,
    ] {
        let rsp = RingResponse::new(9, 128, 0, status);
        assert_eq!(rsp.id, 9);
        assert_eq!(rsp.status(), status);
    }
}

#[test]
fn full_indirect_page_roundtrip() {
    let refs: Vec<GrantRef> = (1..=MAX_SEGMENTS_PER_PAGE as u32).map(GrantRef).collect();
    let mut page = vec![0u8; PAGE_SIZE];
    write_indirect_table(&refs, &mut page);
    assert_eq!(read_indirect_table(&page).unwrap(), refs);
}

#[test]
fn completed_iso_table_readback() {
    let mut page = vec![0u8; PAGE_SIZE];
    let submitted: Vec<IsoPacket> = (0..4)
        .map(|i| IsoPacket {
            offset: i * 1024,
            length: 1024,
            status: 0,
        })
        .collect();
    write_iso_table(&submitted, &mut page);

    // The completing side rewrites lengths and statuses in place.
    let mut completed = read_iso_table(&page, 4).unwrap();
    completed[2].length = 512;
    completed[3].status = TransferStatus::Crc.to_wire();
    write_iso_table(&completed, &mut page);

    let back = read_iso_table(&page, 4).unwrap();
    assert_eq!(back[2].length, 512);
    assert_eq!(back[3].status(), TransferStatus::Crc);
    assert_eq!(back[0], submitted[0]);
}
