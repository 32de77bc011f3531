//! Integration tests for the backend dispatcher
//!
//! Drives a dispatcher over a raw link, playing the frontend by hand:
//! granting pages, filling ring slots and consuming responses directly.

use std::sync::Arc;

use backend::{BackendConfig, BackendContext, MockDevice, NativeStatus};
use common::test_utils::{bytes_from_pages, grant_all, pages_holding, pattern_bytes};
use common::{FrontLink, GrantAccess, Link, Page};
use protocol::{
    DeviceSpeed, FLAG_DIRECT_DATA, FLAG_INDIRECT, FLAG_SHORT_OK, GrantRef, PAGE_SIZE,
    RingRequest, RingResponse, TransferKind, TransferStatus, write_indirect_table,
};

fn test_backend(pending: usize) -> Arc<BackendContext> {
    BackendContext::new(BackendConfig {
        pending_requests: pending,
        enable_timeouts: false,
        ..BackendConfig::default()
    })
}

fn wait_response(front: &mut FrontLink) -> RingResponse {
    loop {
        if let Some(rsp) = front.ring.consume_response() {
            return rsp;
        }
        assert!(front.interrupt.wait(), "backend closed the link");
    }
}

fn submit(front: &mut FrontLink, req: RingRequest) {
    front.ring.produce_request(req);
    front.notify.signal();
}

/// Build a direct bulk request over freshly granted pages.
fn bulk_request(id: u64, endpoint: u8, data_len: usize, grefs: &[GrantRef]) -> RingRequest {
    let mut req = RingRequest::empty(id);
    req.kind = TransferKind::Bulk as u8;
    req.endpoint = endpoint;
    req.length = data_len as u32;
    req.nr_segments = grefs.len() as u8;
    req.segments[..grefs.len()].copy_from_slice(grefs);
    req
}

#[test]
fn direct_bulk_out_reaches_the_device() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(8);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");

    let payload = pattern_bytes(11, 5 * PAGE_SIZE);
    let pages = pages_holding(&payload, 0);
    let grefs = grant_all(&front.grants, &pages, GrantAccess::ReadOnly);

    submit(
        &mut front,
        bulk_request(1, 0x02, payload.len(), &grefs),
    );

    let rsp = wait_response(&mut front);
    assert_eq!(rsp.id, 1);
    assert_eq!(rsp.status(), TransferStatus::Ok);
    assert_eq!(rsp.actual_length as usize, payload.len());
    assert_eq!(dev.out_written(2), payload);

    // Segments were unmapped; grants can be revoked cleanly.
    for gref in grefs {
        front.grants.revoke(gref);
    }
    handle.shutdown();
}

#[test]
fn bulk_in_serves_queued_device_data() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(8);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");

    let expected = pattern_bytes(42, PAGE_SIZE + 300);
    dev.queue_in(1, &expected);

    let pages = pages_holding(&vec![0u8; expected.len()], 0);
    let grefs = grant_all(&front.grants, &pages, GrantAccess::ReadWrite);

    let mut req = bulk_request(2, 0x81, expected.len(), &grefs);
    req.flags |= FLAG_SHORT_OK;
    submit(&mut front, req);

    let rsp = wait_response(&mut front);
    assert_eq!(rsp.status(), TransferStatus::Ok);
    assert_eq!(rsp.actual_length as usize, expected.len());
    assert_eq!(bytes_from_pages(&pages, 0, expected.len()), expected);

    handle.shutdown();
}

#[test]
fn indirect_transfer_matches_direct_semantics() {
    let (mut front, back) = Link::new();
    // Pool large enough for the data segments.
    let ctx = test_backend(8);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");

    // 40 pages is past the direct ceiling of 17.
    let payload = pattern_bytes(99, 40 * PAGE_SIZE);
    let pages = pages_holding(&payload, 0);
    let data_grefs = grant_all(&front.grants, &pages, GrantAccess::ReadOnly);

    // One descriptor page holds all 40 references.
    let desc_page = Page::new();
    desc_page.with_write(|bytes| write_indirect_table(&data_grefs, bytes));
    let desc_gref = front
        .grants
        .establish(Arc::clone(&desc_page), GrantAccess::ReadOnly)
        .unwrap();

    let mut req = RingRequest::empty(3);
    req.kind = TransferKind::Bulk as u8;
    req.endpoint = 0x02;
    req.length = payload.len() as u32;
    req.nr_segments = 1;
    req.flags = FLAG_INDIRECT;
    req.segments[0] = desc_gref;
    submit(&mut front, req);

    let rsp = wait_response(&mut front);
    assert_eq!(rsp.status(), TransferStatus::Ok);
    assert_eq!(dev.out_written(2), payload);

    handle.shutdown();
}

#[test]
fn internal_commands_answer_from_dispatcher_state() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(4);
    let dev = MockDevice::new(DeviceSpeed::Full);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");

    let mut req = RingRequest::empty(1);
    req.kind = TransferKind::GetSpeed as u8;
    submit(&mut front, req);
    let rsp = wait_response(&mut front);
    assert_eq!(rsp.status(), TransferStatus::Ok);
    assert_eq!(rsp.data, DeviceSpeed::Full as u32);

    let mut req = RingRequest::empty(2);
    req.kind = TransferKind::GetFrame as u8;
    submit(&mut front, req);
    assert_eq!(wait_response(&mut front).status(), TransferStatus::Ok);

    let mut req = RingRequest::empty(3);
    req.kind = TransferKind::Reset as u8;
    submit(&mut front, req);
    assert_eq!(wait_response(&mut front).status(), TransferStatus::Ok);
    assert_eq!(dev.reset_count(), 1);

    handle.shutdown();
}

#[test]
fn cancel_unlinks_a_held_transfer() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(4);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");
    dev.hold_completions(true);

    let payload = pattern_bytes(1, 256);
    let pages = pages_holding(&payload, 0);
    let grefs = grant_all(&front.grants, &pages, GrantAccess::ReadOnly);
    submit(
        &mut front,
        bulk_request(7, 0x02, payload.len(), &grefs),
    );

    // Wait until the backend actually holds it.
    while dev.held_count() == 0 {
        std::thread::yield_now();
    }

    let mut cancel = RingRequest::empty(8);
    cancel.kind = TransferKind::Cancel as u8;
    cancel.flags = FLAG_DIRECT_DATA;
    cancel.set_inline_data(7);
    submit(&mut front, cancel);

    // Two responses: the canceled transfer and the cancel command itself,
    // in either order.
    let a = wait_response(&mut front);
    let b = wait_response(&mut front);
    let (victim, cancel_rsp) = if a.id == 7 { (a, b) } else { (b, a) };
    assert_eq!(victim.id, 7);
    assert_eq!(victim.status(), TransferStatus::Canceled);
    assert_eq!(cancel_rsp.id, 8);
    assert_eq!(cancel_rsp.status(), TransferStatus::Ok);

    handle.shutdown();
}

#[test]
fn malformed_requests_get_error_responses_not_crashes() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(4);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");

    // Unknown kind byte.
    let mut req = RingRequest::empty(1);
    req.kind = 0x7f;
    submit(&mut front, req);
    assert_eq!(
        wait_response(&mut front).status(),
        TransferStatus::InvalidArgument
    );

    // Segment count inconsistent with the length.
    let payload = pattern_bytes(5, PAGE_SIZE);
    let pages = pages_holding(&payload, 0);
    let grefs = grant_all(&front.grants, &pages, GrantAccess::ReadOnly);
    let mut req = bulk_request(2, 0x02, payload.len(), &grefs);
    req.nr_segments = 3;
    submit(&mut front, req);
    assert_eq!(
        wait_response(&mut front).status(),
        TransferStatus::InvalidArgument
    );

    // Bogus grant reference.
    let mut req = RingRequest::empty(3);
    req.kind = TransferKind::Bulk as u8;
    req.endpoint = 0x02;
    req.length = 16;
    req.nr_segments = 1;
    req.segments[0] = GrantRef(0xdead);
    submit(&mut front, req);
    assert_eq!(
        wait_response(&mut front).status(),
        TransferStatus::InvalidArgument
    );

    // The dispatcher survived all of it.
    let mut req = RingRequest::empty(4);
    req.kind = TransferKind::GetSpeed as u8;
    submit(&mut front, req);
    assert_eq!(wait_response(&mut front).status(), TransferStatus::Ok);

    handle.shutdown();
}

#[test]
fn pending_pool_exhaustion_is_backpressure_not_error() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(2);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");
    dev.hold_completions(true);

    let payload = pattern_bytes(33, 64);
    let mut granted = Vec::new();
    for id in 0..4u64 {
        let pages = pages_holding(&payload, 0);
        let grefs = grant_all(&front.grants, &pages, GrantAccess::ReadOnly);
        submit(
            &mut front,
            bulk_request(id, 0x02, payload.len(), &grefs),
        );
        granted.push(grefs);
    }
    // Keep the grants alive until every transfer resolves.
    let _granted = granted;

    // Only the pool's worth makes it to the device; the rest wait.
    while dev.held_count() < 2 {
        std::thread::yield_now();
    }
    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(dev.held_count(), 2);

    // Freeing the pool lets the remainder through; every transfer ends Ok.
    dev.hold_completions(false);
    dev.release_all();

    let mut done = 0;
    while done < 4 {
        let rsp = wait_response(&mut front);
        assert_eq!(rsp.status(), TransferStatus::Ok, "id {}", rsp.id);
        done += 1;
    }

    handle.shutdown();
}

#[test]
fn native_error_statuses_map_onto_the_wire() {
    let (mut front, back) = Link::new();
    let ctx = test_backend(4);
    let dev = MockDevice::new(DeviceSpeed::High);
    let handle = ctx.spawn_device(back, dev.clone(), "dev0");

    for (native, wire) in [
        (NativeStatus::Stalled, TransferStatus::Stalled),
        (NativeStatus::NoDevice, TransferStatus::DeviceRemoved),
        (NativeStatus::Crc, TransferStatus::Crc),
        (NativeStatus::Other(-77), TransferStatus::Unknown),
    ] {
        dev.fail_next(2, native);

        let payload = pattern_bytes(2, 32);
        let pages = pages_holding(&payload, 0);
        let grefs = grant_all(&front.grants, &pages, GrantAccess::ReadOnly);
        submit(
            &mut front,
            bulk_request(1, 0x02, payload.len(), &grefs),
        );
        assert_eq!(wait_response(&mut front).status(), wire);
    }

    handle.shutdown();
}
