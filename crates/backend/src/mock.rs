//! Loopback mock device
//!
//! A [`NativeDevice`] used by the test suites and the sim binary. OUT data
//! is recorded per endpoint; IN endpoints serve bytes queued ahead of
//! time. Completions run inline by default, or can be held in flight and
//! released later to exercise cancellation and shutdown races.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

use protocol::{
    DeviceSpeed, IsoPacket, REQ_GET_DESCRIPTOR, TransferKind, read_iso_table, write_iso_table,
};

use crate::native::{NativeDevice, NativeStatus, Urb, UrbCompletion, UrbResult};

struct HeldOp {
    urb: Urb,
    done: UrbCompletion,
}

#[derive(Default)]
struct MockInner {
    out_data: HashMap<u8, Vec<u8>>,
    in_data: HashMap<u8, Vec<u8>>,
    held: Vec<HeldOp>,
    hold: bool,
    fail_next: HashMap<u8, NativeStatus>,
    resets: u32,
    cycles: u32,
}

/// In-memory loopback device
pub struct MockDevice {
    inner: Mutex<MockInner>,
    speed: DeviceSpeed,
    frame: AtomicU32,
    descriptor: Vec<u8>,
}

impl MockDevice {
    pub fn new(speed: DeviceSpeed) -> Arc<MockDevice> {
        Arc::new(MockDevice {
            inner: Mutex::new(MockInner::default()),
            speed,
            frame: AtomicU32::new(0),
            descriptor: device_descriptor(false),
        })
    }

    /// A device whose descriptor reports USB 3, for exercising the
    /// SuperSpeed descriptor fix-up on the controller side.
    pub fn new_superspeed() -> Arc<MockDevice> {
        Arc::new(MockDevice {
            inner: Mutex::new(MockInner::default()),
            speed: DeviceSpeed::Super,
            frame: AtomicU32::new(0),
            descriptor: device_descriptor(true),
        })
    }

    /// Hold every subsequent URB in flight until released or unlinked.
    pub fn hold_completions(&self, hold: bool) {
        self.inner.lock().hold = hold;
    }

    /// Complete every held URB in submission order.
    pub fn release_all(&self) {
        let held: Vec<HeldOp> = std::mem::take(&mut self.inner.lock().held);
        for op in held {
            let result = self.execute(&op.urb);
            (op.done)(result);
        }
    }

    /// Number of URBs currently held in flight.
    pub fn held_count(&self) -> usize {
        self.inner.lock().held.len()
    }

    /// Fail the next URB on `endpoint` (number, not address) with `status`.
    pub fn fail_next(&self, endpoint: u8, status: NativeStatus) {
        self.inner.lock().fail_next.insert(endpoint, status);
    }

    /// Queue bytes an IN endpoint will serve.
    pub fn queue_in(&self, endpoint: u8, data: &[u8]) {
        self.inner
            .lock()
            .in_data
            .entry(endpoint)
            .or_default()
            .extend_from_slice(data);
    }

    /// Everything written to an OUT endpoint so far.
    pub fn out_written(&self, endpoint: u8) -> Vec<u8> {
        self.inner
            .lock()
            .out_data
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    pub fn reset_count(&self) -> u32 {
        self.inner.lock().resets
    }

    pub fn cycle_count(&self) -> u32 {
        self.inner.lock().cycles
    }

    fn execute(&self, urb: &Urb) -> UrbResult {
        match urb.kind {
            TransferKind::Control => self.execute_control(urb),
            TransferKind::Bulk | TransferKind::Interrupt => self.execute_stream(urb),
            TransferKind::Isochronous => self.execute_iso(urb),
            _ => UrbResult::error(NativeStatus::InvalidArgument),
        }
    }

    fn execute_control(&self, urb: &Urb) -> UrbResult {
        let Some(setup) = urb.setup else {
            return UrbResult::error(NativeStatus::InvalidArgument);
        };

        if setup.is_dir_in() && setup.request == REQ_GET_DESCRIPTOR {
            let len = self
                .descriptor
                .len()
                .min(urb.buffer.len())
                .min(setup.length as usize);
            urb.buffer.write_all(&self.descriptor[..len]);
            return UrbResult {
                status: NativeStatus::Completed,
                actual_length: len as u32,
                start_frame: 0,
            };
        }

        // Any other control request is acknowledged; an OUT data stage is
        // consumed whole.
        UrbResult {
            status: NativeStatus::Completed,
            actual_length: urb.buffer.len() as u32,
            start_frame: 0,
        }
    }

    fn execute_stream(&self, urb: &Urb) -> UrbResult {
        let ep = urb.endpoint & protocol::types::ENDPOINT_NUMBER_MASK;
        let mut inner = self.inner.lock();

        if urb.dir_in {
            let queued = inner.in_data.entry(ep).or_default();
            let take = queued.len().min(urb.buffer.len());
            let data: Vec<u8> = queued.drain(..take).collect();
            drop(inner);

            urb.buffer.write_all(&data);
            let status = if take < urb.buffer.len() && take > 0 && !urb.short_ok {
                NativeStatus::ShortPacket
            } else {
                NativeStatus::Completed
            };
            UrbResult {
                status,
                actual_length: take as u32,
                start_frame: 0,
            }
        } else {
            let data = urb.buffer.read_all();
            inner.out_data.entry(ep).or_default().extend_from_slice(&data);
            UrbResult {
                status: NativeStatus::Completed,
                actual_length: data.len() as u32,
                start_frame: 0,
            }
        }
    }

    fn execute_iso(&self, urb: &Urb) -> UrbResult {
        let Some(iso) = &urb.iso else {
            return UrbResult::error(NativeStatus::InvalidArgument);
        };
        let ep = urb.endpoint & protocol::types::ENDPOINT_NUMBER_MASK;

        let table = iso.page.snapshot();
        let mut packets: Vec<IsoPacket> = match read_iso_table(&table, iso.nr_packets as usize) {
            Ok(p) => p,
            Err(_) => return UrbResult::error(NativeStatus::InvalidArgument),
        };

        let mut total = 0u32;
        for packet in packets.iter_mut() {
            let offset = packet.offset as usize;
            let length = packet.length as usize;
            if urb.dir_in {
                let data: Vec<u8> = {
                    let mut inner = self.inner.lock();
                    let queued = inner.in_data.entry(ep).or_default();
                    let take = queued.len().min(length);
                    queued.drain(..take).collect()
                };
                urb.buffer.write_at(offset, &data);
                packet.length = data.len() as u16;
            } else {
                let all = urb.buffer.read_all();
                let end = (offset + length).min(all.len());
                let mut inner = self.inner.lock();
                inner
                    .out_data
                    .entry(ep)
                    .or_default()
                    .extend_from_slice(&all[offset.min(end)..end]);
            }
            packet.status = 0;
            total += packet.length as u32;
        }

        iso.page.with_write(|bytes| write_iso_table(&packets, bytes));

        UrbResult {
            status: NativeStatus::Completed,
            actual_length: total,
            start_frame: self.frame.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl NativeDevice for MockDevice {
    fn submit(&self, urb: Urb, done: UrbCompletion) {
        let ep = urb.endpoint & protocol::types::ENDPOINT_NUMBER_MASK;
        {
            let mut inner = self.inner.lock();
            if let Some(status) = inner.fail_next.remove(&ep) {
                drop(inner);
                done(UrbResult::error(status));
                return;
            }
            if inner.hold {
                debug!(id = urb.id, "holding urb in flight");
                inner.held.push(HeldOp { urb, done });
                return;
            }
        }

        let result = self.execute(&urb);
        done(result);
    }

    fn unlink(&self, id: u64) -> bool {
        let op = {
            let mut inner = self.inner.lock();
            let pos = inner.held.iter().position(|op| op.urb.id == id);
            pos.map(|p| inner.held.remove(p))
        };
        match op {
            Some(op) => {
                debug!(id, "unlinking held urb");
                (op.done)(UrbResult::error(NativeStatus::Unlinked));
                true
            }
            None => false,
        }
    }

    fn reset(&self) -> Result<(), NativeStatus> {
        self.flush();
        self.inner.lock().resets += 1;
        Ok(())
    }

    fn cycle_port(&self) {
        self.inner.lock().cycles += 1;
    }

    fn abort_endpoint(&self, endpoint: u8) -> Result<(), NativeStatus> {
        let ep = endpoint & protocol::types::ENDPOINT_NUMBER_MASK;
        let aborted: Vec<HeldOp> = {
            let mut inner = self.inner.lock();
            let (hit, keep) = std::mem::take(&mut inner.held)
                .into_iter()
                .partition(|op| op.urb.endpoint & protocol::types::ENDPOINT_NUMBER_MASK == ep);
            inner.held = keep;
            hit
        };
        for op in aborted {
            (op.done)(UrbResult::error(NativeStatus::Unlinked));
        }
        Ok(())
    }

    fn current_frame(&self) -> Result<u32, NativeStatus> {
        Ok(self.frame.fetch_add(1, Ordering::Relaxed))
    }

    fn speed(&self) -> DeviceSpeed {
        self.speed
    }

    fn flush(&self) {
        let held: Vec<HeldOp> = std::mem::take(&mut self.inner.lock().held);
        for op in held {
            (op.done)(UrbResult::error(NativeStatus::Unlinked));
        }
    }
}

fn device_descriptor(superspeed: bool) -> Vec<u8> {
    let mut desc = vec![0u8; 18];
    desc[0] = 18; // bLength
    desc[1] = 0x01; // bDescriptorType: device
    if superspeed {
        desc[2] = 0x00;
        desc[3] = 0x03; // bcdUSB 3.00
        desc[7] = 9; // bMaxPacketSize0: 2^9
    } else {
        desc[2] = 0x00;
        desc[3] = 0x02; // bcdUSB 2.00
        desc[7] = 64;
    }
    desc[4] = 0x00; // class
    desc[8] = 0x5e;
    desc[9] = 0x04; // idVendor
    desc[10] = 0x34;
    desc[11] = 0x12; // idProduct
    desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::ScatterBuffer;
    use common::test_utils::{pages_holding, pattern_bytes};
    use std::sync::mpsc;

    fn bulk_out(id: u64, endpoint: u8, data: &[u8]) -> Urb {
        let pages = pages_holding(data, 0);
        Urb {
            id,
            kind: TransferKind::Bulk,
            endpoint,
            dir_in: false,
            setup: None,
            short_ok: false,
            buffer: ScatterBuffer::new(pages, 0, data.len()),
            iso: None,
        }
    }

    #[test]
    fn loopback_records_out_data() {
        let dev = MockDevice::new(DeviceSpeed::High);
        let payload = pattern_bytes(1, 1000);

        let (tx, rx) = mpsc::channel();
        dev.submit(
            bulk_out(1, 0x02, &payload),
            Box::new(move |r| tx.send(r).unwrap()),
        );

        let result = rx.recv().unwrap();
        assert_eq!(result.status, NativeStatus::Completed);
        assert_eq!(result.actual_length, 1000);
        assert_eq!(dev.out_written(2), payload);
    }

    #[test]
    fn held_urb_unlinks_with_unlinked_status() {
        let dev = MockDevice::new(DeviceSpeed::High);
        dev.hold_completions(true);

        let (tx, rx) = mpsc::channel();
        dev.submit(
            bulk_out(7, 0x02, b"stuck"),
            Box::new(move |r| tx.send(r).unwrap()),
        );
        assert_eq!(dev.held_count(), 1);
        assert!(rx.try_recv().is_err());

        assert!(dev.unlink(7));
        assert_eq!(rx.recv().unwrap().status, NativeStatus::Unlinked);
        assert!(!dev.unlink(7), "second unlink finds nothing");
    }

    #[test]
    fn in_endpoint_serves_queued_bytes() {
        let dev = MockDevice::new(DeviceSpeed::High);
        dev.queue_in(1, b"abcdef");

        let pages = pages_holding(&[0u8; 6], 0);
        let buffer = ScatterBuffer::new(pages, 0, 6);
        let urb = Urb {
            id: 2,
            kind: TransferKind::Interrupt,
            endpoint: 0x81,
            dir_in: true,
            setup: None,
            short_ok: true,
            buffer: buffer.clone(),
            iso: None,
        };

        let (tx, rx) = mpsc::channel();
        dev.submit(urb, Box::new(move |r| tx.send(r).unwrap()));
        let result = rx.recv().unwrap();
        assert_eq!(result.actual_length, 6);
        assert_eq!(buffer.read_all(), b"abcdef");
    }
}
