//! Virtual device
//!
//! Everything on the guest side of one link: the ring front half, the
//! shadow pool and the pending/finish/release queues, all under one
//! per-device lock. The notification handler is short and non-blocking;
//! per-kind completion fix-up and delivery to the caller run in the
//! deferred worker, and release always happens outside the lock.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use common::{Doorbell, FrontRing, GrantAccess, GrantTable, Page};
use protocol::{
    DeviceSpeed, ENDPOINT_DIR_IN, FLAG_ASAP, FLAG_CYCLE_PORT, FLAG_DIRECT_DATA, FLAG_INDIRECT,
    FLAG_RESET, FLAG_SHORT_OK, GrantRef, MAX_ISO_PACKETS, MAX_ISO_SEGMENTS,
    MAX_PAGES_PER_INDIRECT_ISO_REQUEST, MAX_PAGES_PER_INDIRECT_REQUEST, MAX_SEGMENTS_PER_PAGE,
    MAX_SEGMENTS_PER_REQUEST, REQ_GET_DESCRIPTOR, REQ_SET_ADDRESS, RingResponse, TransferId,
    TransferKind, TransferStatus, read_iso_table, write_indirect_table, write_iso_table,
};

use crate::controller::HcdEvent;
use crate::shadow::{Shadow, ShadowPool, ShadowRelease};
use crate::transfer::{TransferRequest, TransferState};

/// Shadow slots held back so internal commands (reset, cancel) can always
/// be sent even with scheduled I/O saturating the ring.
const SHADOW_FLOOR: usize = 1;

/// How long connect waits for the speed response.
const SPEED_WAIT: Duration = Duration::from_secs(5);

/// How long teardown pumps the ring before giving up on stragglers.
const FLUSH_WAIT: Duration = Duration::from_secs(5);

pub(crate) enum InternalCmd {
    Reset,
    CyclePort,
    Speed,
    Cancel(u64),
}

#[derive(Debug)]
pub(crate) enum SendError {
    /// Shadow floor or grant exhaustion; try again later.
    Retry,
    /// The transfer can never be sent as shaped.
    Invalid(&'static str),
}

pub(crate) enum SendOutcome {
    Sent,
    /// Completed locally (address intercept or validation drop); the urbp
    /// is on the release queue.
    Completed,
    Retry,
}

#[derive(Debug, Default)]
pub(crate) struct NotifySummary {
    pub reset_completed: bool,
    pub flush_drained: bool,
}

pub(crate) struct Urbp {
    pub transfer: TransferRequest,
    pub state: TransferState,
    pub ring_id: Option<u64>,
    pub rsp: Option<RingResponse>,
    pub iso_page: Option<Arc<Page>>,
    pub cancel_requested: bool,
}

pub(crate) struct DeviceInner {
    ring: FrontRing,
    shadows: ShadowPool,
    pending: VecDeque<Urbp>,
    finish: VecDeque<Urbp>,
    release: Vec<Urbp>,
    rflush: bool,
    speed: Option<DeviceSpeed>,
    is_ss: bool,
}

/// The guest side of one connected device
pub struct VirtualDevice {
    port: u8,
    address: AtomicU16,
    grants: Arc<GrantTable>,
    /// Rings the backend; every produce is followed by a signal.
    notify: Doorbell,
    /// Kicks the deferred worker.
    pub(crate) work: Doorbell,
    inner: Mutex<DeviceInner>,
    state_changed: Condvar,
    events: async_channel::Sender<HcdEvent>,
}

impl VirtualDevice {
    pub(crate) fn new(
        port: u8,
        ring: FrontRing,
        grants: Arc<GrantTable>,
        notify: Doorbell,
        work: Doorbell,
        events: async_channel::Sender<HcdEvent>,
    ) -> Arc<VirtualDevice> {
        Arc::new(VirtualDevice {
            port,
            address: AtomicU16::new(0),
            grants,
            notify,
            work,
            inner: Mutex::new(DeviceInner {
                ring,
                shadows: ShadowPool::new(),
                pending: VecDeque::new(),
                finish: VecDeque::new(),
                release: Vec::new(),
                rflush: false,
                speed: None,
                is_ss: false,
            }),
            state_changed: Condvar::new(),
            events,
        })
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn address(&self) -> u16 {
        self.address.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> Option<DeviceSpeed> {
        self.inner.lock().speed
    }

    /// (free, in-use) shadow counts; their sum is always the ring
    /// capacity.
    pub fn shadow_counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.shadows.free(), inner.shadows.in_use())
    }

    /// Transfers awaiting a response or fix-up.
    pub fn in_flight(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.finish.len()
    }

    // ---------------------------------------------------------------
    // Submission

    /// Drive one new transfer. Never blocks; a starved shadow pool hands
    /// the transfer back as `SendOutcome::Retry` converted by the caller.
    pub(crate) fn submit(
        &self,
        transfer: TransferRequest,
    ) -> Result<(), Box<TransferRequest>> {
        let released = {
            let mut inner = self.inner.lock();
            // Response processing first: it can free shadows we need.
            self.finish_all(&mut inner);

            let mut urbp = Urbp {
                transfer,
                state: TransferState::New,
                ring_id: None,
                rsp: None,
                iso_page: None,
                cancel_requested: false,
            };
            match self.send_urb(&mut inner, &mut urbp) {
                SendOutcome::Sent => {
                    inner.pending.push_back(urbp);
                }
                SendOutcome::Completed => {
                    inner.release.push(urbp);
                }
                SendOutcome::Retry => {
                    let released = std::mem::take(&mut inner.release);
                    drop(inner);
                    self.deliver(released);
                    return Err(Box::new(urbp.transfer));
                }
            }
            std::mem::take(&mut inner.release)
        };
        self.deliver(released);
        Ok(())
    }

    fn send_urb(&self, inner: &mut DeviceInner, urbp: &mut Urbp) -> SendOutcome {
        debug_assert_eq!(urbp.state, TransferState::New);

        // SET_ADDRESS never reaches the backend; the address is a purely
        // local affair.
        if urbp.transfer.kind == TransferKind::Control {
            if let Some(setup) = urbp.transfer.setup {
                if setup.request == REQ_SET_ADDRESS && !setup.is_dir_in() {
                    self.address.store(setup.value, Ordering::Relaxed);
                    debug!(port = self.port, address = setup.value, "set address");
                    urbp.transfer.status = TransferStatus::Ok;
                    urbp.state = TransferState::Done;
                    return SendOutcome::Completed;
                }
            } else {
                warn!(port = self.port, "control transfer without setup packet");
                urbp.transfer.status = TransferStatus::InvalidArgument;
                urbp.state = TransferState::Dropped;
                return SendOutcome::Completed;
            }
        }

        let result = match urbp.transfer.kind {
            TransferKind::Isochronous => self.put_isochronous_urb(inner, urbp),
            TransferKind::Control | TransferKind::Bulk | TransferKind::Interrupt => {
                self.put_urb(inner, urbp)
            }
            _ => Err(SendError::Invalid("internal kinds cannot be enqueued")),
        };

        match result {
            Ok(()) => {
                urbp.state = TransferState::Sent;
                SendOutcome::Sent
            }
            Err(SendError::Retry) => SendOutcome::Retry,
            Err(SendError::Invalid(reason)) => {
                warn!(port = self.port, id = urbp.transfer.id.0, reason, "dropping transfer");
                urbp.transfer.status = TransferStatus::InvalidArgument;
                urbp.state = TransferState::Dropped;
                SendOutcome::Completed
            }
        }
    }

    fn put_urb(&self, inner: &mut DeviceInner, urbp: &mut Urbp) -> Result<(), SendError> {
        let pages = urbp.transfer.buffer.page_count();
        let indirect = pages > MAX_SEGMENTS_PER_REQUEST;
        if indirect {
            if urbp.transfer.kind != TransferKind::Bulk {
                return Err(SendError::Invalid("too many pages for a non-bulk transfer"));
            }
            if pages > MAX_PAGES_PER_INDIRECT_REQUEST {
                return Err(SendError::Invalid("too many pages for any transfer"));
            }
        }

        // Leave room for internal commands.
        if inner.shadows.free() <= SHADOW_FLOOR {
            return Err(SendError::Retry);
        }
        let idx = inner.shadows.get().expect("shadow available above floor");

        let built: Result<(), SendError> = (|| {
            let dir_in = urbp.transfer.is_dir_in();
            let pages = urbp.transfer.buffer.pages().to_vec();
            let data_grefs = self.grant_buffer(inner, idx, &pages, dir_in)?;

            let shadow = inner.shadows.at_mut(idx as u64);
            if urbp.transfer.short_ok && dir_in {
                shadow.req.flags |= FLAG_SHORT_OK;
            }
            if indirect {
                Self::lay_out_indirect(&self.grants, shadow, &data_grefs)?;
            } else {
                for (i, gref) in data_grefs.iter().enumerate() {
                    shadow.req.segments[i] = *gref;
                }
                shadow.req.nr_segments = data_grefs.len() as u8;
            }

            shadow.req.kind = urbp.transfer.kind as u8;
            shadow.req.endpoint = urbp.transfer.endpoint;
            shadow.req.offset = urbp.transfer.buffer.offset() as u16;
            shadow.req.length = urbp.transfer.buffer.len() as u32;
            shadow.req.nr_packets = 0;
            shadow.req.start_frame = 0;
            shadow.req.setup = match urbp.transfer.setup {
                Some(setup) if urbp.transfer.kind == TransferKind::Control => setup.pack(),
                _ => 0,
            };
            Ok(())
        })();

        if let Err(err) = built {
            self.revoke_release(inner.shadows.put(idx as u64));
            return Err(err);
        }

        self.push_shadow(inner, idx, urbp);
        Ok(())
    }

    fn put_isochronous_urb(
        &self,
        inner: &mut DeviceInner,
        urbp: &mut Urbp,
    ) -> Result<(), SendError> {
        let transfer = &urbp.transfer;
        if transfer.buffer.is_empty() || transfer.iso_packets.is_empty() {
            return Err(SendError::Invalid("isochronous transfer without data"));
        }
        if transfer.iso_packets.len() > MAX_ISO_PACKETS {
            return Err(SendError::Invalid("too many isochronous packets"));
        }

        let pages = transfer.buffer.page_count();
        let indirect = pages > MAX_ISO_SEGMENTS;
        if indirect && pages > MAX_PAGES_PER_INDIRECT_ISO_REQUEST {
            return Err(SendError::Invalid("too many pages for any transfer"));
        }

        if inner.shadows.free() <= SHADOW_FLOOR {
            return Err(SendError::Retry);
        }
        let idx = inner.shadows.get().expect("shadow available above floor");

        let built: Result<(), SendError> = (|| {
            let dir_in = urbp.transfer.is_dir_in();

            // The packet table page goes first; the backend completes
            // per-packet results into it.
            let iso_page = Page::new();
            iso_page.with_write(|bytes| write_iso_table(&urbp.transfer.iso_packets, bytes));
            let iso_gref = self
                .grants
                .establish(Arc::clone(&iso_page), GrantAccess::ReadWrite)
                .map_err(|_| SendError::Retry)?;
            {
                let shadow = inner.shadows.at_mut(idx as u64);
                shadow.grefs.push(iso_gref);
                shadow.iso_page = Some(iso_page);
            }

            let pages = urbp.transfer.buffer.pages().to_vec();
            let data_grefs = self.grant_buffer(inner, idx, &pages, dir_in)?;

            let shadow = inner.shadows.at_mut(idx as u64);
            if urbp.transfer.short_ok && dir_in {
                shadow.req.flags |= FLAG_SHORT_OK;
            }
            if urbp.transfer.iso_asap {
                shadow.req.flags |= FLAG_ASAP;
            }

            if indirect {
                let mut refs = Vec::with_capacity(1 + data_grefs.len());
                refs.push(iso_gref);
                refs.extend_from_slice(&data_grefs);
                Self::lay_out_indirect(&self.grants, shadow, &refs)?;
            } else {
                shadow.req.segments[0] = iso_gref;
                for (i, gref) in data_grefs.iter().enumerate() {
                    shadow.req.segments[i + 1] = *gref;
                }
                shadow.req.nr_segments = (1 + data_grefs.len()) as u8;
            }

            shadow.req.kind = TransferKind::Isochronous as u8;
            shadow.req.endpoint = urbp.transfer.endpoint;
            shadow.req.offset = urbp.transfer.buffer.offset() as u16;
            shadow.req.length = urbp.transfer.buffer.len() as u32;
            shadow.req.nr_packets = urbp.transfer.iso_packets.len() as u16;
            shadow.req.start_frame = urbp.transfer.start_frame;
            shadow.req.setup = 0;
            Ok(())
        })();

        if let Err(err) = built {
            self.revoke_release(inner.shadows.put(idx as u64));
            return Err(err);
        }

        self.push_shadow(inner, idx, urbp);
        Ok(())
    }

    /// Grant every buffer page, recording the refs in the shadow so a
    /// failed send unwinds through the normal release path.
    fn grant_buffer(
        &self,
        inner: &mut DeviceInner,
        idx: u16,
        pages: &[Arc<Page>],
        dir_in: bool,
    ) -> Result<Vec<GrantRef>, SendError> {
        let access = if dir_in {
            GrantAccess::ReadWrite
        } else {
            GrantAccess::ReadOnly
        };

        let shadow = inner.shadows.at_mut(idx as u64);
        let mut grefs = Vec::with_capacity(pages.len());
        for page in pages {
            match self.grants.establish(Arc::clone(page), access) {
                Ok(gref) => {
                    grefs.push(gref);
                    shadow.grefs.push(gref);
                }
                Err(_) => return Err(SendError::Retry),
            }
        }
        Ok(grefs)
    }

    /// Chunk grant refs into indirect descriptor pages and point the
    /// request at them.
    fn lay_out_indirect(
        grants: &GrantTable,
        shadow: &mut Shadow,
        refs: &[GrantRef],
    ) -> Result<(), SendError> {
        let chunks: Vec<&[GrantRef]> = refs.chunks(MAX_SEGMENTS_PER_PAGE).collect();
        debug_assert!(chunks.len() <= MAX_SEGMENTS_PER_REQUEST);

        for (i, chunk) in chunks.iter().enumerate() {
            let page = Page::new();
            page.with_write(|bytes| write_indirect_table(chunk, bytes));
            let gref = grants
                .establish(Arc::clone(&page), GrantAccess::ReadOnly)
                .map_err(|_| SendError::Retry)?;
            shadow.req.segments[i] = gref;
            shadow.grefs.push(gref);
            shadow.indirect_pages.push(page);
        }
        shadow.req.nr_segments = chunks.len() as u8;
        shadow.req.flags |= FLAG_INDIRECT;
        Ok(())
    }

    /// Publish a filled shadow on the ring and notify unconditionally.
    fn push_shadow(&self, inner: &mut DeviceInner, idx: u16, urbp: &mut Urbp) {
        {
            let shadow = inner.shadows.at_mut(idx as u64);
            shadow.transfer = Some(urbp.transfer.id);
        }
        let req = inner.shadows.at(idx as u64).req;
        inner.ring.produce_request(req);
        self.notify.signal();

        urbp.ring_id = Some(idx as u64);
        debug!(
            port = self.port,
            id = urbp.transfer.id.0,
            ring_id = idx,
            kind = ?urbp.transfer.kind,
            len = urbp.transfer.buffer.len(),
            "sent"
        );
    }

    /// Put an internal command on the ring; may use the reserved slot.
    pub(crate) fn put_internal_request(
        &self,
        inner: &mut DeviceInner,
        cmd: InternalCmd,
    ) -> Result<(), ()> {
        let Some(idx) = inner.shadows.get() else {
            return Err(());
        };
        {
            let shadow = inner.shadows.at_mut(idx as u64);
            match cmd {
                InternalCmd::Reset => {
                    shadow.req.kind = TransferKind::Reset as u8;
                    shadow.req.flags = FLAG_RESET;
                }
                InternalCmd::CyclePort => {
                    shadow.req.kind = TransferKind::Reset as u8;
                    shadow.req.flags = FLAG_CYCLE_PORT;
                }
                InternalCmd::Speed => {
                    shadow.req.kind = TransferKind::GetSpeed as u8;
                    shadow.req.endpoint = ENDPOINT_DIR_IN;
                }
                InternalCmd::Cancel(target) => {
                    shadow.req.kind = TransferKind::Cancel as u8;
                    shadow.req.flags = FLAG_DIRECT_DATA;
                    shadow.req.set_inline_data(target);
                }
            }
        }
        let req = inner.shadows.at(idx as u64).req;
        inner.ring.produce_request(req);
        self.notify.signal();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Response path

    /// Notification handler: drain every available response. Short and
    /// non-blocking; per-kind fix-up is deferred to the worker.
    pub(crate) fn on_notify(&self) -> NotifySummary {
        let mut summary = NotifySummary::default();
        {
            let mut inner = self.inner.lock();
            while let Some(rsp) = inner.ring.consume_response() {
                // The backend is the privileged side; a bad slot id is
                // fatal here, unlike the mirror case on the backend.
                let (raw_kind, raw_flags) = {
                    let shadow = inner.shadows.at(rsp.id);
                    (shadow.req.kind, shadow.req.flags)
                };
                let kind = TransferKind::from_wire(raw_kind)
                    .expect("in-use shadow holds a valid kind");

                if kind.is_internal() {
                    match kind {
                        TransferKind::GetSpeed => {
                            let speed = DeviceSpeed::from_wire(rsp.data).unwrap_or_else(|| {
                                warn!(
                                    port = self.port,
                                    raw = rsp.data,
                                    "unrecognized speed, defaulting to high"
                                );
                                DeviceSpeed::High
                            });
                            if speed == DeviceSpeed::Super {
                                // A USB 2 controller fronts this device;
                                // remember to doctor its descriptors.
                                inner.is_ss = true;
                                inner.speed = Some(DeviceSpeed::High);
                            } else {
                                inner.speed = Some(speed);
                            }
                        }
                        // Cycle-port shares the reset kind; only a true
                        // reset wakes the reset worker.
                        TransferKind::Reset if raw_flags & FLAG_RESET != 0 => {
                            summary.reset_completed = true;
                        }
                        // Cancel and cycle confirmations carry nothing.
                        _ => {}
                    }
                    let release = inner.shadows.put(rsp.id);
                    self.revoke_release(release);
                    continue;
                }

                // Copy the response over and park the transfer for the
                // worker; the shadow is released there too.
                let pos = inner
                    .pending
                    .iter()
                    .position(|u| u.ring_id == Some(rsp.id))
                    .expect("response for a transfer not pending");
                let mut urbp = inner.pending.remove(pos).expect("position just found");
                urbp.rsp = Some(rsp);
                urbp.iso_page = inner.shadows.at_mut(rsp.id).iso_page.take();
                inner.finish.push_back(urbp);
            }

            if inner.rflush && inner.ring.drained() {
                inner.rflush = false;
                summary.flush_drained = true;
            }
        }
        self.state_changed.notify_all();
        summary
    }

    /// Deferred processing: finish fix-ups, retry deferred sends, deliver.
    pub(crate) fn process(&self) {
        let released = {
            let mut inner = self.inner.lock();
            self.finish_all(&mut inner);
            self.drive_pending(&mut inner);
            std::mem::take(&mut inner.release)
        };
        self.deliver(released);
    }

    fn finish_all(&self, inner: &mut DeviceInner) {
        while let Some(urbp) = inner.finish.pop_front() {
            let done = self.finish_urb(inner, urbp);
            inner.release.push(done);
        }
    }

    fn drive_pending(&self, inner: &mut DeviceInner) {
        let mut keep = VecDeque::new();
        while let Some(mut urbp) = inner.pending.pop_front() {
            if urbp.state == TransferState::New {
                match self.send_urb(inner, &mut urbp) {
                    SendOutcome::Sent | SendOutcome::Retry => keep.push_back(urbp),
                    SendOutcome::Completed => inner.release.push(urbp),
                }
            } else {
                keep.push_back(urbp);
            }
        }
        inner.pending = keep;
    }

    fn finish_urb(&self, inner: &mut DeviceInner, mut urbp: Urbp) -> Urbp {
        let rsp = urbp.rsp.expect("finishing a transfer without a response");

        // Give the shadow back first; ordering guarantees the backend is
        // done with the pages by the time its response is visible.
        let release = inner.shadows.put(rsp.id);
        self.revoke_release(release);

        match urbp.transfer.kind {
            TransferKind::Control => self.finish_control(inner.is_ss, &mut urbp, rsp),
            TransferKind::Isochronous => finish_isochronous(&mut urbp, rsp),
            TransferKind::Bulk | TransferKind::Interrupt => finish_common(&mut urbp, rsp),
            _ => unreachable!("internal kinds never queue transfers"),
        }

        if urbp.state != TransferState::Dropped {
            urbp.state = TransferState::Done;
        }
        urbp
    }

    fn finish_control(&self, is_ss: bool, urbp: &mut Urbp, rsp: RingResponse) {
        // A USB 3 device behind a USB 2 controller: doctor the device
        // descriptor so the stack above sees a USB 2 device.
        if is_ss && urbp.state != TransferState::Cancel {
            if let Some(setup) = urbp.transfer.setup {
                if setup.request == REQ_GET_DESCRIPTOR
                    && (setup.value & 0xff00) == 0x0100
                    && rsp.actual_length >= 18
                    && rsp.status().is_ok()
                {
                    let head = urbp.transfer.buffer.read_bytes(0, 8);
                    if head[1] == 0x01 && head[3] == 0x03 {
                        info!(port = self.port, "rewriting USB 3 device descriptor as USB 2");
                        let mut patched = head;
                        patched[2] = 0x10;
                        patched[3] = 0x02;
                        patched[7] = 0x40;
                        urbp.transfer.buffer.write_bytes(0, &patched);
                    }
                }
            }
        }
        finish_common(urbp, rsp);
    }

    fn deliver(&self, released: Vec<Urbp>) {
        for urbp in released {
            debug!(
                port = self.port,
                id = urbp.transfer.id.0,
                status = %urbp.transfer.status,
                len = urbp.transfer.actual_length,
                "giveback"
            );
            let _ = self
                .events
                .try_send(HcdEvent::TransferComplete(Box::new(urbp.transfer)));
        }
    }

    fn revoke_release(&self, release: ShadowRelease) {
        if release.direct_data {
            return;
        }
        for gref in release.grefs {
            self.grants.revoke(gref);
        }
    }

    // ---------------------------------------------------------------
    // Cancellation and lifecycle

    /// Cancel one transfer with `terminal` as its recorded status.
    ///
    /// Unsent transfers are released immediately; sent ones are flagged
    /// and shot down in the backend, resolving through the response path
    /// so exactly one completion ever happens.
    pub(crate) fn cancel(&self, id: TransferId, terminal: TransferStatus) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            let Some(pos) = inner.pending.iter().position(|u| u.transfer.id == id) else {
                return false;
            };

            match inner.pending[pos].state {
                TransferState::New => {
                    let mut urbp = inner.pending.remove(pos).expect("position just found");
                    urbp.transfer.status = terminal;
                    urbp.state = TransferState::Dropped;
                    inner.release.push(urbp);
                }
                TransferState::Sent => {
                    let ring_id = inner.pending[pos].ring_id.expect("sent transfer has ring id");
                    inner.pending[pos].state = TransferState::Cancel;
                    inner.pending[pos].transfer.status = terminal;
                    match self.put_internal_request(&mut inner, InternalCmd::Cancel(ring_id)) {
                        Ok(()) => inner.pending[pos].cancel_requested = true,
                        Err(()) => {
                            warn!(
                                port = self.port,
                                ring_id, "no shadow for cancel command; deferred"
                            );
                        }
                    }
                }
                // Already canceling or finishing; nothing more to do.
                _ => {}
            }
            std::mem::take(&mut inner.release)
        };
        self.deliver(released);
        true
    }

    /// Ask the backend for the device speed and wait for the answer.
    pub(crate) fn query_speed(&self) -> Result<DeviceSpeed, ()> {
        let mut inner = self.inner.lock();
        inner.speed = None;
        self.put_internal_request(&mut inner, InternalCmd::Speed)?;

        let deadline = Instant::now() + SPEED_WAIT;
        while inner.speed.is_none() {
            if self
                .state_changed
                .wait_until(&mut inner, deadline)
                .timed_out()
            {
                warn!(port = self.port, "speed query timed out");
                return Err(());
            }
        }
        Ok(inner.speed.expect("loop exits with speed set"))
    }

    /// Submit the internal reset command; the response wakes the port's
    /// reset worker.
    pub(crate) fn submit_reset(&self) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        self.put_internal_request(&mut inner, InternalCmd::Reset)
    }

    /// Ask the backend to force re-enumeration of the device. Fire and
    /// forget; the confirmation needs no waiter.
    pub(crate) fn submit_cycle(&self) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        self.put_internal_request(&mut inner, InternalCmd::CyclePort)
    }

    /// Teardown flush: stop everything, shoot down in-flight transfers
    /// and drain the ring until every produced request has its response.
    ///
    /// Transfers that never complete through the backend surface with
    /// `Shutdown` status; nothing hangs past `FLUSH_WAIT`.
    pub(crate) fn shutdown_flush(&self) {
        // Phase one: mark the flush, drop unsent transfers, flag sent
        // ones for cancellation.
        let released = {
            let mut inner = self.inner.lock();
            inner.rflush = true;

            let mut keep = VecDeque::new();
            while let Some(mut urbp) = inner.pending.pop_front() {
                match urbp.state {
                    TransferState::New => {
                        urbp.transfer.status = TransferStatus::Shutdown;
                        urbp.state = TransferState::Dropped;
                        inner.release.push(urbp);
                    }
                    TransferState::Sent => {
                        urbp.state = TransferState::Cancel;
                        urbp.transfer.status = TransferStatus::Shutdown;
                        keep.push_back(urbp);
                    }
                    _ => keep.push_back(urbp),
                }
            }
            inner.pending = keep;
            std::mem::take(&mut inner.release)
        };
        self.deliver(released);

        // Phase two: pump cancels as shadows free up and wait for the
        // ring to drain completely.
        let deadline = Instant::now() + FLUSH_WAIT;
        loop {
            let mut inner = self.inner.lock();

            let targets: Vec<u64> = inner
                .pending
                .iter()
                .filter(|u| u.state == TransferState::Cancel && !u.cancel_requested)
                .map(|u| u.ring_id.expect("canceling transfer has ring id"))
                .collect();
            for target in targets {
                if self
                    .put_internal_request(&mut inner, InternalCmd::Cancel(target))
                    .is_err()
                {
                    break;
                }
                let pos = inner
                    .pending
                    .iter()
                    .position(|u| u.ring_id == Some(target))
                    .expect("target still pending");
                inner.pending[pos].cancel_requested = true;
            }

            if inner.ring.drained() {
                inner.rflush = false;
                break;
            }
            if Instant::now() >= deadline {
                warn!(port = self.port, "ring flush timed out with responses outstanding");
                break;
            }
            let _ = self
                .state_changed
                .wait_until(&mut inner, (Instant::now() + Duration::from_millis(20)).min(deadline));
        }

        // Phase three: final processing pass; everything still pending is
        // surfaced with its recorded shutdown status.
        let released = {
            let mut inner = self.inner.lock();
            self.finish_all(&mut inner);
            while let Some(mut urbp) = inner.pending.pop_front() {
                warn!(
                    port = self.port,
                    id = urbp.transfer.id.0,
                    "transfer abandoned by flush"
                );
                if let Some(ring_id) = urbp.ring_id {
                    // No response ever came, so the backend may still hold
                    // mappings; leak these grants rather than revoke them
                    // out from under it.
                    let _leaked = inner.shadows.put(ring_id);
                }
                urbp.transfer.status = TransferStatus::Shutdown;
                urbp.state = TransferState::Dropped;
                inner.release.push(urbp);
            }
            std::mem::take(&mut inner.release)
        };
        self.deliver(released);
    }
}

fn finish_common(urbp: &mut Urbp, rsp: RingResponse) {
    // Canceled in the backend: the locally recorded status stands, not
    // whatever the response carries.
    if urbp.state == TransferState::Cancel {
        return;
    }

    let status = rsp.status();
    urbp.transfer.status = status;
    if !status.is_ok() {
        warn!(
            id = urbp.transfer.id.0,
            %status,
            "transfer failed"
        );
        return;
    }

    // The backend never legitimately returns more than was asked for.
    if urbp.transfer.is_dir_in() && rsp.actual_length as usize > urbp.transfer.buffer.len() {
        warn!(
            id = urbp.transfer.id.0,
            expect = urbp.transfer.buffer.len(),
            got = rsp.actual_length,
            "IN response too large"
        );
        urbp.transfer.status = TransferStatus::Unknown;
        return;
    }

    urbp.transfer.actual_length = rsp.actual_length;
}

fn finish_isochronous(urbp: &mut Urbp, rsp: RingResponse) {
    let submitted = urbp.transfer.iso_packets.clone();

    if urbp.state == TransferState::Cancel {
        for packet in urbp.transfer.iso_packets.iter_mut() {
            packet.length = 0;
            packet.status = urbp.transfer.status.to_wire();
        }
        return;
    }

    urbp.transfer.status = rsp.status();
    if !urbp.transfer.status.is_ok() {
        fail_all_packets(urbp);
        return;
    }

    let Some(page) = urbp.iso_page.take() else {
        urbp.transfer.status = TransferStatus::Unknown;
        fail_all_packets(urbp);
        return;
    };
    let table = page.snapshot();
    let completed = match read_iso_table(&table, submitted.len()) {
        Ok(packets) => packets,
        Err(_) => {
            urbp.transfer.status = TransferStatus::Unknown;
            fail_all_packets(urbp);
            return;
        }
    };

    let dir_in = urbp.transfer.is_dir_in();
    let mut total = 0u32;
    urbp.transfer.error_count = 0;
    for (i, done) in completed.iter().enumerate() {
        if done.length > submitted[i].length {
            warn!(id = urbp.transfer.id.0, packet = i, "isochronous packet too long");
            urbp.transfer.status = TransferStatus::Unknown;
            fail_all_packets(urbp);
            return;
        }
        if dir_in && (total as usize + done.length as usize) > urbp.transfer.buffer.len() {
            warn!(id = urbp.transfer.id.0, packet = i, "isochronous response overruns buffer");
            urbp.transfer.status = TransferStatus::Unknown;
            fail_all_packets(urbp);
            return;
        }

        urbp.transfer.iso_packets[i] = *done;
        if done.status().is_ok() {
            total += done.length as u32;
        } else {
            urbp.transfer.error_count += 1;
        }
    }

    if urbp.transfer.iso_asap {
        urbp.transfer.start_frame = rsp.data;
    }
    urbp.transfer.actual_length = total;
}

fn fail_all_packets(urbp: &mut Urbp) {
    let status = urbp.transfer.status.to_wire();
    for packet in urbp.transfer.iso_packets.iter_mut() {
        packet.length = 0;
        packet.status = status;
    }
    urbp.transfer.actual_length = 0;
}
