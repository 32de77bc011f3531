//! End-to-end transport tests
//!
//! A virtual host controller wired to a backend dispatcher over a real
//! link, with the loopback mock standing in for the native USB stack.
//! Covers the full lifecycle: connect, transfers in both directions and
//! layouts, cancellation races, backpressure and teardown.

use std::sync::Arc;
use std::time::Duration;

use backend::{BackendConfig, BackendContext, DeviceHandle, MockDevice};
use common::Link;
use frontend::{HcdEvent, PortState, TransferRequest, VirtualHcd};
use frontend::{PORT_STAT_C_RESET, PORT_STAT_CONNECTION};
use protocol::{
    DeviceId, DeviceSpeed, PAGE_SIZE, RING_CAPACITY, SetupPacket, TransferId, TransferStatus,
};

struct Rig {
    hcd: Arc<VirtualHcd>,
    events: async_channel::Receiver<HcdEvent>,
    _ctx: Arc<BackendContext>,
    handle: Option<DeviceHandle>,
    dev: Arc<MockDevice>,
}

impl Rig {
    fn new(dev: Arc<MockDevice>) -> Rig {
        let (hcd, events) = VirtualHcd::new(4);
        let ctx = BackendContext::new(BackendConfig {
            pending_requests: 64,
            enable_timeouts: false,
            ..BackendConfig::default()
        });
        let (front, back) = Link::new();
        let handle = ctx.spawn_device(back, dev.clone(), "mock0");

        hcd.on_connect(1, DeviceId(1), front).expect("connect");
        assert_eq!(hcd.port_state(1).unwrap(), PortState::Present);

        // Drain the connect-time port events so completion-counting
        // assertions see transfers only.
        while events.try_recv().is_ok() {}

        Rig {
            hcd,
            events,
            _ctx: ctx,
            handle: Some(handle),
            dev,
        }
    }

    fn wait_transfer(&self, id: TransferId) -> TransferRequest {
        loop {
            match self
                .events
                .recv_blocking()
                .expect("event channel stays open")
            {
                HcdEvent::TransferComplete(t) if t.id == id => return *t,
                _ => {}
            }
        }
    }

    fn finish(mut self) {
        self.hcd.shutdown();
        if let Some(handle) = self.handle.take() {
            handle.shutdown();
        }
    }
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add((i % 251) as u8)).collect()
}

#[test]
fn connect_reports_speed_and_connection() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::Full));
    let status = rig.hcd.port_status(1).unwrap();
    assert!(status & PORT_STAT_CONNECTION != 0);
    rig.finish();
}

#[test]
fn bulk_out_five_segments_completes_ok() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    let payload = pattern(7, 5 * PAGE_SIZE);
    let transfer = TransferRequest::bulk_out(TransferId(1), 0x02, &payload);
    rig.hcd.enqueue(1, transfer).expect("enqueue");

    let done = rig.wait_transfer(TransferId(1));
    assert_eq!(done.status, TransferStatus::Ok);
    assert_eq!(done.actual_length as usize, payload.len());
    assert_eq!(rig.dev.out_written(2), payload);

    rig.finish();
}

#[test]
fn bulk_in_returns_device_data() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    let expected = pattern(21, 2 * PAGE_SIZE + 123);
    rig.dev.queue_in(1, &expected);

    rig.hcd
        .enqueue(1, TransferRequest::bulk_in(TransferId(2), 0x01, expected.len()))
        .expect("enqueue");

    let done = rig.wait_transfer(TransferId(2));
    assert_eq!(done.status, TransferStatus::Ok);
    assert_eq!(done.data(), expected);

    rig.finish();
}

#[test]
fn indirect_path_carries_the_same_bytes_as_direct() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    // Below the direct threshold.
    let small = pattern(1, 16 * PAGE_SIZE);
    rig.hcd
        .enqueue(1, TransferRequest::bulk_out(TransferId(10), 0x02, &small))
        .expect("enqueue");
    assert_eq!(rig.wait_transfer(TransferId(10)).status, TransferStatus::Ok);

    // Above it: 40 pages goes through the indirect layout.
    let large = pattern(2, 40 * PAGE_SIZE);
    rig.hcd
        .enqueue(1, TransferRequest::bulk_out(TransferId(11), 0x02, &large))
        .expect("enqueue");
    assert_eq!(rig.wait_transfer(TransferId(11)).status, TransferStatus::Ok);

    let mut expected = small.clone();
    expected.extend_from_slice(&large);
    assert_eq!(rig.dev.out_written(2), expected);

    // Everything was reclaimed: free + in-use stays at capacity, with
    // nothing left in use.
    let vdev = rig.hcd.device(1).expect("device attached");
    let (free, in_use) = vdev.shadow_counts();
    assert_eq!(free + in_use, RING_CAPACITY);
    assert_eq!(in_use, 0);

    rig.finish();
}

#[test]
fn enqueue_backpressure_returns_retry_not_corruption() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));
    rig.dev.hold_completions(true);

    // Fill the ring until the shadow floor pushes back.
    let mut accepted = Vec::new();
    let mut retried = None;
    for i in 0..RING_CAPACITY as u64 + 1 {
        let transfer = TransferRequest::bulk_out(TransferId(i), 0x02, &pattern(3, 64));
        match rig.hcd.enqueue(1, transfer) {
            Ok(()) => accepted.push(TransferId(i)),
            Err(frontend::EnqueueError::Retry(t)) => {
                retried = Some(*t);
                break;
            }
            Err(e) => panic!("unexpected enqueue error: {e}"),
        }
    }
    let retried = retried.expect("backpressure before the ring overflows");
    assert!(accepted.len() < RING_CAPACITY + 1);
    assert_eq!(retried.status, TransferStatus::Pending, "untouched transfer");

    // Nothing was lost: release the device and every accepted transfer
    // completes, after which the rejected one goes through too.
    rig.dev.hold_completions(false);
    rig.dev.release_all();
    for id in &accepted {
        assert_eq!(rig.wait_transfer(*id).status, TransferStatus::Ok);
    }

    let retry_id = retried.id;
    rig.hcd.enqueue(1, retried).expect("retry succeeds after drain");
    let done = rig.wait_transfer(retry_id);
    assert_eq!(done.status, TransferStatus::Ok);

    rig.finish();
}

#[test]
fn dequeue_of_sent_transfer_resolves_exactly_once() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));
    rig.dev.hold_completions(true);

    let transfer = TransferRequest::bulk_out(TransferId(5), 0x02, &pattern(4, 512));
    rig.hcd.enqueue(1, transfer).expect("enqueue");
    while rig.dev.held_count() == 0 {
        std::thread::yield_now();
    }

    rig.hcd.dequeue(1, TransferId(5)).expect("dequeue");

    let done = rig.wait_transfer(TransferId(5));
    assert_eq!(done.status, TransferStatus::Canceled);

    // No second completion for the same id.
    std::thread::sleep(Duration::from_millis(50));
    assert!(rig.events.try_recv().is_err(), "single completion only");

    // A later dequeue finds nothing.
    assert!(rig.hcd.dequeue(1, TransferId(5)).is_err());

    rig.finish();
}

#[test]
fn dequeue_racing_natural_completion_still_completes_once() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    for round in 0..50u64 {
        rig.dev.hold_completions(true);
        let id = TransferId(100 + round);
        rig.hcd
            .enqueue(1, TransferRequest::bulk_out(id, 0x02, &pattern(5, 128)))
            .expect("enqueue");
        while rig.dev.held_count() == 0 {
            std::thread::yield_now();
        }

        // Race the cancel against the natural completion.
        let dev = rig.dev.clone();
        let releaser = std::thread::spawn(move || {
            dev.hold_completions(false);
            dev.release_all();
        });
        let _ = rig.hcd.dequeue(1, id);
        releaser.join().unwrap();

        let done = rig.wait_transfer(id);
        assert!(
            matches!(done.status, TransferStatus::Ok | TransferStatus::Canceled),
            "terminal status, got {}",
            done.status
        );

        // Exactly one completion: the next round's transfer is the next
        // event seen for this endpoint.
        std::thread::sleep(Duration::from_millis(5));
        assert!(rig.events.try_recv().is_err(), "round {round}");
    }

    rig.finish();
}

#[test]
fn superspeed_descriptor_is_rewritten_for_usb2() {
    let rig = Rig::new(MockDevice::new_superspeed());

    let setup = SetupPacket {
        request_type: 0x80,
        request: 0x06,
        value: 0x0100,
        index: 0,
        length: 18,
    };
    let transfer = TransferRequest::control(
        TransferId(1),
        setup,
        frontend::TransferBuffer::for_input(18),
    );
    rig.hcd.enqueue(1, transfer).expect("enqueue");

    let done = rig.wait_transfer(TransferId(1));
    assert_eq!(done.status, TransferStatus::Ok);
    let desc = done.data();
    assert_eq!(desc[3], 0x02, "bcdUSB rewritten to 2.x");
    assert_eq!(desc[2], 0x10);
    assert_eq!(desc[7], 0x40, "bMaxPacketSize0 rewritten");

    rig.finish();
}

#[test]
fn set_address_is_answered_locally() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    let setup = SetupPacket {
        request_type: 0x00,
        request: 0x05,
        value: 42,
        index: 0,
        length: 0,
    };
    let transfer =
        TransferRequest::control(TransferId(3), setup, frontend::TransferBuffer::empty());
    rig.hcd.enqueue(1, transfer).expect("enqueue");

    let done = rig.wait_transfer(TransferId(3));
    assert_eq!(done.status, TransferStatus::Ok);

    rig.finish();
}

#[test]
fn isochronous_roundtrip_applies_per_packet_results() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    let payload = pattern(9, 4 * 1024);
    let transfer = TransferRequest::isochronous_out(TransferId(4), 0x03, &payload, 1024);
    rig.hcd.enqueue(1, transfer).expect("enqueue");

    let done = rig.wait_transfer(TransferId(4));
    assert_eq!(done.status, TransferStatus::Ok);
    assert_eq!(done.actual_length as usize, payload.len());
    assert_eq!(done.error_count, 0);
    assert_eq!(done.iso_packets.len(), 4);
    assert!(done.iso_packets.iter().all(|p| p.status().is_ok()));
    assert_eq!(rig.dev.out_written(3), payload);

    rig.finish();
}

#[test]
fn port_reset_uses_a_one_shot_gate() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    assert!(rig.hcd.request_reset(1).expect("reset"));

    // Wait for the reset change bit to surface.
    loop {
        match rig.events.recv_blocking().expect("events open") {
            HcdEvent::PortStatusChanged { port: 1, status } if status & PORT_STAT_C_RESET != 0 => {
                break;
            }
            _ => {}
        }
    }
    assert_eq!(rig.dev.reset_count(), 1);

    // The gate reopened; a new reset is accepted.
    assert!(rig.hcd.request_reset(1).expect("second reset"));

    rig.finish();
}

#[test]
fn cycle_port_reaches_the_device() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    rig.hcd.request_cycle(1).expect("cycle");
    // Confirmation is fire-and-forget; poll the device side.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while rig.dev.cycle_count() == 0 {
        assert!(std::time::Instant::now() < deadline, "cycle never arrived");
        std::thread::yield_now();
    }

    rig.finish();
}

#[test]
fn closing_mid_flight_surfaces_shutdown_not_a_hang() {
    let rig = Rig::new(MockDevice::new(DeviceSpeed::High));

    // First transfer completes normally.
    let payload = pattern(6, 5 * PAGE_SIZE);
    rig.hcd
        .enqueue(1, TransferRequest::bulk_out(TransferId(1), 0x02, &payload))
        .expect("enqueue");
    let done = rig.wait_transfer(TransferId(1));
    assert_eq!(done.status, TransferStatus::Ok);
    assert_eq!(done.actual_length as usize, payload.len());

    // Second transfer is stuck in the device when the port closes.
    rig.dev.hold_completions(true);
    rig.hcd
        .enqueue(1, TransferRequest::bulk_out(TransferId(2), 0x02, &pattern(8, 256)))
        .expect("enqueue");
    while rig.dev.held_count() == 0 {
        std::thread::yield_now();
    }

    rig.hcd.on_disconnect(1).expect("disconnect");
    assert_eq!(rig.hcd.port_state(1).unwrap(), PortState::Empty);

    let done = rig.wait_transfer(TransferId(2));
    assert_eq!(done.status, TransferStatus::Shutdown);

    // The port is reusable afterwards.
    rig.finish();
}
