//! Backend dispatcher
//!
//! One worker thread per connected device drains the ring: internal
//! commands are answered synchronously from dispatcher state, data-bearing
//! requests get a pending request, mapped segments and an asynchronous
//! native submission. Completion callbacks produce the response and defer
//! the blocking free to the reaper worker.
//!
//! Pool exhaustion pauses the drain with the request left in place and
//! resumes on the next notify or pool-free doorbell; it is never reported
//! to the remote side as an error.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use common::{BackLink, Doorbell, DoorbellWaiter, GrantTable, Page, RingError};
use protocol::{
    GrantRef, MAX_ISO_PACKETS, MAX_SEGMENTS_PER_REQUEST, MAX_TRANSFER_BYTES, RingRequest,
    RingResponse, TransferKind, TransferStatus, read_indirect_table, span_pages,
};

use crate::native::{
    IsoTable, NativeDevice, NativeStatus, ScatterBuffer, Urb, UrbCompletion, UrbResult,
    map_native_status,
};
use crate::pools::{BackendPools, PendingId, PendingRequest, Segment};
use crate::timeout::TimeoutScheduler;

/// Tunables for one backend context
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Size of the global pending-request pool.
    pub pending_requests: usize,
    /// Watchdog deadline for control and OUT transfers.
    pub transfer_timeout: Duration,
    /// Disable watchdogs entirely (tests that hold completions).
    pub enable_timeouts: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig {
            pending_requests: 64,
            transfer_timeout: Duration::from_secs(15),
            enable_timeouts: true,
        }
    }
}

/// Per-device transfer counters, logged when the dispatcher exits
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub oo_req: u64,
    pub in_req: u64,
    pub out_req: u64,
    pub cntrl_req: u64,
    pub isoc_req: u64,
    pub bulk_req: u64,
    pub int_req: u64,
    pub ind_req: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub errors: u64,
    pub resets: u64,
}

impl DispatchStats {
    fn note_kind(&mut self, kind: TransferKind, dir_in: bool, indirect: bool) {
        if dir_in {
            self.in_req += 1;
        } else {
            self.out_req += 1;
        }
        if indirect {
            self.ind_req += 1;
        }
        match kind {
            TransferKind::Control => self.cntrl_req += 1,
            TransferKind::Isochronous => self.isoc_req += 1,
            TransferKind::Bulk => self.bulk_req += 1,
            TransferKind::Interrupt => self.int_req += 1,
            _ => {}
        }
    }
}

/// Response production shared between the dispatcher thread and the
/// completion callbacks
///
/// The ring's response side is serialized by this mutex because both
/// contexts produce responses; the ring counters themselves stay
/// single-writer underneath it.
pub(crate) struct Responder {
    name: String,
    ring: Mutex<common::BackRing>,
    notify: Doorbell,
    wake_self: Doorbell,
    canceling: AtomicBool,
    in_flight: Mutex<usize>,
    idle_cv: Condvar,
    stats: Mutex<DispatchStats>,
}

impl Responder {
    fn make_response(&self, id: u64, actual_length: u32, data: u32, status: TransferStatus) {
        debug!(
            device = %self.name,
            id,
            actual_length,
            %status,
            "response"
        );
        if !status.is_ok() {
            self.stats.lock().errors += 1;
        }

        let more = {
            let mut ring = self.ring.lock();
            ring.produce_response(RingResponse::new(id, actual_length, data, status));
            ring.has_unconsumed_requests()
        };
        if more {
            self.wake_self.signal();
        }
        // Unconditional: the peer never relies on holdoff heuristics.
        self.notify.signal();
    }

    fn inc_in_flight(&self) {
        *self.in_flight.lock() += 1;
    }

    fn dec_in_flight(&self) {
        let mut count = self.in_flight.lock();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.idle_cv.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.in_flight.lock();
        while *count > 0 {
            self.idle_cv.wait(&mut count);
        }
    }
}

/// Release every grant mapping a pending request holds.
fn fast_flush(grants: &GrantTable, preq: &mut PendingRequest) {
    for seg in preq
        .segments
        .iter_mut()
        .chain(preq.indirect_segments.iter_mut())
    {
        if let Some(mapped) = seg.mapped.take() {
            grants.unmap(mapped);
        }
    }
}

/// Completion path: runs in whatever context the native stack calls from,
/// so it never blocks. The pending request itself is freed by the reaper.
fn complete_urb(
    shared: Arc<Responder>,
    grants: Arc<GrantTable>,
    reaper: async_channel::Sender<PendingRequest>,
    mut preq: PendingRequest,
    result: UrbResult,
) {
    if let Some(timer) = preq.timer.take() {
        timer.cancel();
    }

    let native_status = if shared.canceling.load(Ordering::Acquire) {
        NativeStatus::ConnectionReset
    } else {
        result.status
    };
    let status = map_native_status(native_status);
    debug!(
        device = %shared.name,
        id = preq.ring_id,
        len = result.actual_length,
        %status,
        "urb complete"
    );

    if status.is_ok() {
        let mut stats = shared.stats.lock();
        if preq.dir_in {
            stats.in_bytes += preq.length as u64;
        } else {
            stats.out_bytes += preq.length as u64;
        }
    }

    fast_flush(&grants, &mut preq);
    shared.make_response(preq.ring_id, result.actual_length, result.start_frame, status);
    shared.dec_in_flight();

    if reaper.try_send(preq).is_err() {
        warn!(device = %shared.name, "reaper gone; leaking pool slots at shutdown");
    }
}

/// The global backend state: pools, reaper and timers
///
/// Constructed once and passed to every device dispatcher; nothing here is
/// a hidden static.
pub struct BackendContext {
    pools: Arc<BackendPools>,
    timers: Arc<TimeoutScheduler>,
    reaper_tx: async_channel::Sender<PendingRequest>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
    config: BackendConfig,
}

impl BackendContext {
    pub fn new(config: BackendConfig) -> Arc<BackendContext> {
        let pools = Arc::new(BackendPools::new(config.pending_requests));
        let timers = TimeoutScheduler::new();
        let timer_thread = timers.spawn();

        let (reaper_tx, reaper_rx) = async_channel::unbounded::<PendingRequest>();
        let reaper_pools = Arc::clone(&pools);
        let reaper = std::thread::Builder::new()
            .name("usb-reaper".into())
            .spawn(move || {
                while let Ok(preq) = reaper_rx.recv_blocking() {
                    reaper_pools.free(preq);
                }
            })
            .expect("spawn reaper thread");

        Arc::new(BackendContext {
            pools,
            timers,
            reaper_tx,
            reaper: Mutex::new(Some(reaper)),
            timer_thread: Mutex::new(Some(timer_thread)),
            config,
        })
    }

    pub fn pools(&self) -> &Arc<BackendPools> {
        &self.pools
    }

    /// Attach a dispatcher worker to one device link.
    pub fn spawn_device(
        &self,
        link: BackLink,
        native: Arc<dyn NativeDevice>,
        name: &str,
    ) -> DeviceHandle {
        let BackLink {
            ring,
            grants,
            notify,
            wakeup,
            wakeup_signal,
        } = link;

        self.pools.subscribe(wakeup_signal.clone());

        let shared = Arc::new(Responder {
            name: name.to_string(),
            ring: Mutex::new(ring),
            notify,
            wake_self: wakeup_signal.clone(),
            canceling: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            idle_cv: Condvar::new(),
            stats: Mutex::new(DispatchStats::default()),
        });
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker = DeviceWorker {
            shared: Arc::clone(&shared),
            wakeup,
            grants,
            native,
            pools: Arc::clone(&self.pools),
            timers: Arc::clone(&self.timers),
            reaper_tx: self.reaper_tx.clone(),
            shutdown: Arc::clone(&shutdown),
            timeout: self.config.transfer_timeout,
            enable_timeouts: self.config.enable_timeouts,
            parked: None,
        };

        let thread = std::thread::Builder::new()
            .name(format!("usb-dispatch-{name}"))
            .spawn(move || worker.run())
            .expect("spawn dispatcher thread");

        // Catch anything produced before we attached.
        wakeup_signal.signal();

        DeviceHandle {
            thread: Some(thread),
            shutdown,
            wake: wakeup_signal,
            shared,
        }
    }

    /// Stop the reaper and timer workers. Device handles must be shut
    /// down first.
    pub fn shutdown(&self) {
        self.reaper_tx.close();
        if let Some(thread) = self.reaper.lock().take() {
            let _ = thread.join();
        }
        self.timers.shutdown();
        if let Some(thread) = self.timer_thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BackendContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle on one running device dispatcher
pub struct DeviceHandle {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Doorbell,
    shared: Arc<Responder>,
}

impl DeviceHandle {
    /// Stop the worker: flushes native I/O, answers any ring residue with
    /// `Shutdown`, and joins the thread.
    pub fn shutdown(mut self) {
        self.trigger_shutdown();
    }

    pub fn stats(&self) -> DispatchStats {
        self.shared.stats.lock().clone()
    }

    fn trigger_shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.trigger_shutdown();
        }
    }
}

enum Outcome {
    /// Submitted, or failed with a response already produced.
    Done,
    /// Segment pool empty; retry the same request on the next wakeup.
    Parked(PendingId, RingRequest),
}

struct DeviceWorker {
    shared: Arc<Responder>,
    wakeup: DoorbellWaiter,
    grants: Arc<GrantTable>,
    native: Arc<dyn NativeDevice>,
    pools: Arc<BackendPools>,
    timers: Arc<TimeoutScheduler>,
    reaper_tx: async_channel::Sender<PendingRequest>,
    shutdown: Arc<AtomicBool>,
    timeout: Duration,
    enable_timeouts: bool,
    parked: Option<(PendingId, RingRequest)>,
}

impl DeviceWorker {
    fn run(mut self) {
        info!(device = %self.shared.name, "dispatcher started");

        loop {
            if !self.wakeup.wait() {
                break;
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match self.do_io() {
                Ok(_more) => {
                    // Exhaustion and empty-ring both resume via doorbells.
                }
                Err(err) => {
                    error!(
                        device = %self.shared.name,
                        %err,
                        "protocol violation from frontend, terminating connection"
                    );
                    break;
                }
            }
        }

        self.teardown();
    }

    fn do_io(&mut self) -> Result<bool, RingError> {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(false);
            }

            // A request parked on segment exhaustion keeps FIFO order:
            // nothing else is consumed until it goes through.
            if let Some((pid, req)) = self.parked.take() {
                match self.dispatch_urb(req, pid) {
                    Outcome::Done => {}
                    Outcome::Parked(pid, req) => {
                        self.parked = Some((pid, req));
                        return Ok(true);
                    }
                }
                continue;
            }

            // Reserve the pending slot before consuming, so exhaustion
            // leaves the request on the ring instead of dropping it.
            let Some(pid) = self.pools.alloc_pending() else {
                self.shared.stats.lock().oo_req += 1;
                return Ok(true);
            };

            let consumed = self.shared.ring.lock().consume_request();
            let req = match consumed {
                Ok(Some(req)) => req,
                Ok(None) => {
                    self.pools.release_pending_unused(pid);
                    return Ok(false);
                }
                Err(err) => {
                    self.pools.release_pending_unused(pid);
                    return Err(err);
                }
            };

            self.handle_request(req, pid);
        }
    }

    fn handle_request(&mut self, req: RingRequest, pid: PendingId) {
        let Some(kind) = req.kind() else {
            warn!(device = %self.shared.name, kind = req.kind, "invalid request kind");
            self.shared
                .make_response(req.id, 0, 0, TransferStatus::InvalidArgument);
            self.pools.release_pending_unused(pid);
            return;
        };

        // Internal commands bypass the pools and answer from dispatcher
        // state.
        if req.wants_reset() {
            self.shared.stats.lock().resets += 1;
            let status = match self.native.reset() {
                Ok(()) => TransferStatus::Ok,
                Err(e) => map_native_status(e),
            };
            self.shared.make_response(req.id, 0, 0, status);
            self.pools.release_pending_unused(pid);
            return;
        }
        if req.wants_cycle_port() {
            self.native.cycle_port();
            self.shared.make_response(req.id, 0, 0, TransferStatus::Ok);
            self.pools.release_pending_unused(pid);
            return;
        }

        match kind {
            TransferKind::AbortPipe => {
                let status = match self.native.abort_endpoint(req.endpoint) {
                    Ok(()) => TransferStatus::Ok,
                    Err(e) => map_native_status(e),
                };
                self.shared.make_response(req.id, 0, 0, status);
                self.pools.release_pending_unused(pid);
            }
            TransferKind::GetFrame => {
                match self.native.current_frame() {
                    Ok(frame) => self.shared.make_response(req.id, 0, frame, TransferStatus::Ok),
                    Err(e) => self.shared.make_response(req.id, 0, 0, map_native_status(e)),
                }
                self.pools.release_pending_unused(pid);
            }
            TransferKind::GetSpeed => {
                let speed = self.native.speed() as u32;
                self.shared.make_response(req.id, 0, speed, TransferStatus::Ok);
                self.pools.release_pending_unused(pid);
            }
            TransferKind::Cancel => {
                let target = req.inline_data();
                let found = self.native.unlink(target);
                debug!(device = %self.shared.name, target, found, "cancel command");
                self.shared.make_response(req.id, 0, 0, TransferStatus::Ok);
                self.pools.release_pending_unused(pid);
            }
            TransferKind::Reset => unreachable!("handled via wants_reset"),
            _ => match self.dispatch_urb(req, pid) {
                Outcome::Done => {}
                Outcome::Parked(pid, req) => {
                    self.shared.stats.lock().oo_req += 1;
                    self.parked = Some((pid, req));
                }
            },
        }
    }

    fn dispatch_urb(&mut self, req: RingRequest, pid: PendingId) -> Outcome {
        // kind() was validated before we got here.
        let kind = req.kind().expect("validated kind");
        let iso = kind == TransferKind::Isochronous;
        let dir_in = req.is_dir_in();

        debug!(
            device = %self.shared.name,
            id = req.id,
            ?kind,
            dir = if dir_in { "IN" } else { "OUT" },
            endpoint = req.endpoint_number(),
            len = req.length,
            offset = req.offset,
            segs = req.nr_segments,
            flags = req.flags,
            "dispatch"
        );

        if req.length > MAX_TRANSFER_BYTES {
            warn!(device = %self.shared.name, len = req.length, "request too large");
            return self.fail_plain(req.id, pid);
        }
        if iso && (req.nr_packets == 0 || req.nr_packets as usize > MAX_ISO_PACKETS) {
            warn!(device = %self.shared.name, packets = req.nr_packets, "bad packet count");
            return self.fail_plain(req.id, pid);
        }

        let mut preq = PendingRequest {
            pending_id: pid,
            ring_id: req.id,
            kind,
            dir_in,
            length: req.length,
            segments: Vec::new(),
            indirect_segments: Vec::new(),
            timer: None,
        };

        let has_data = req.length > 0 || iso;
        let data_pages = span_pages(req.offset as usize, req.length as usize);
        let expected = data_pages + usize::from(iso);

        if has_data {
            let nseg = req.nr_segments as usize;
            let geometry_ok = nseg > 0
                && nseg <= MAX_SEGMENTS_PER_REQUEST
                && (req.is_indirect() || nseg == expected);
            if !geometry_ok {
                warn!(
                    device = %self.shared.name,
                    nseg,
                    expected,
                    indirect = req.is_indirect(),
                    "bad segment geometry"
                );
                return self.fail_plain(req.id, pid);
            }

            let Some(segments) = self.pools.reserve_segments(nseg) else {
                return Outcome::Parked(pid, req);
            };
            preq.segments = segments;

            // Map the direct segments: descriptor pages read-only, the
            // packet table writable, data pages writable only for IN.
            for i in 0..nseg {
                let write = if req.is_indirect() {
                    false
                } else if iso && i == 0 {
                    true
                } else {
                    dir_in
                };
                match self.grants.map(req.segments[i], write) {
                    Ok(mapped) => preq.segments[i].mapped = Some(mapped),
                    Err(err) => {
                        warn!(device = %self.shared.name, %err, "direct map failed");
                        return self.fail_urb(preq);
                    }
                }
            }

            if req.is_indirect() {
                match self.setup_indirect(&req, &mut preq, expected, iso, dir_in) {
                    Ok(true) => {}
                    Ok(false) => return self.fail_urb(preq),
                    // Segment pool empty mid-setup: unwind and park.
                    Err(()) => {
                        fast_flush(&self.grants, &mut preq);
                        self.pools.release_segments(&mut preq.segments);
                        self.pools.release_segments(&mut preq.indirect_segments);
                        return Outcome::Parked(pid, req);
                    }
                }
            }
        }

        // Assemble the zero-copy data window and the iso table page.
        let data_segments: &[Segment] = if preq.is_indirect() {
            &preq.indirect_segments
        } else {
            &preq.segments
        };
        let (iso_page, data_segments): (Option<Arc<Page>>, &[Segment]) = if iso {
            let first = data_segments
                .first()
                .and_then(|s| s.mapped.as_ref())
                .map(|m| Arc::clone(m.page()));
            match first {
                Some(page) => (Some(page), &data_segments[1..]),
                None => {
                    warn!(device = %self.shared.name, "iso request without packet table");
                    return self.fail_urb(preq);
                }
            }
        } else {
            (None, data_segments)
        };

        let pages: Vec<Arc<Page>> = data_segments
            .iter()
            .map(|s| Arc::clone(s.mapped.as_ref().expect("segment mapped").page()))
            .collect();
        let buffer = if req.length > 0 {
            ScatterBuffer::new(pages, req.offset as usize, req.length as usize)
        } else {
            ScatterBuffer::empty()
        };

        let urb = Urb {
            id: req.id,
            kind,
            endpoint: req.endpoint,
            dir_in,
            setup: (kind == TransferKind::Control).then(|| req.setup_packet()),
            short_ok: req.is_short_ok(),
            buffer,
            iso: iso_page.map(|page| IsoTable {
                page,
                nr_packets: req.nr_packets,
                start_frame: req.start_frame,
                asap: req.is_asap(),
            }),
        };

        self.shared
            .stats
            .lock()
            .note_kind(kind, dir_in, req.is_indirect());

        if self.enable_timeouts && req.wants_timeout() {
            let native = Arc::clone(&self.native);
            let id = req.id;
            preq.timer = Some(self.timers.schedule(
                self.timeout,
                Box::new(move || {
                    native.unlink(id);
                }),
            ));
        }

        self.shared.inc_in_flight();
        let shared = Arc::clone(&self.shared);
        let grants = Arc::clone(&self.grants);
        let reaper = self.reaper_tx.clone();
        let done: UrbCompletion =
            Box::new(move |result| complete_urb(shared, grants, reaper, preq, result));
        self.native.submit(urb, done);

        Outcome::Done
    }

    /// Map the data segments referenced through indirect descriptor pages.
    ///
    /// `Ok(false)` is malformed input; `Err(())` is segment exhaustion.
    fn setup_indirect(
        &self,
        req: &RingRequest,
        preq: &mut PendingRequest,
        expected: usize,
        iso: bool,
        dir_in: bool,
    ) -> Result<bool, ()> {
        let mut refs: Vec<GrantRef> = Vec::with_capacity(expected);
        for seg in &preq.segments {
            let page = seg.mapped.as_ref().expect("descriptor page mapped").page();
            match page.with_read(read_indirect_table) {
                Ok(table) => refs.extend(table),
                Err(err) => {
                    warn!(device = %self.shared.name, %err, "bad indirect descriptor table");
                    return Ok(false);
                }
            }
        }

        if refs.len() != expected {
            warn!(
                device = %self.shared.name,
                got = refs.len(),
                expected,
                "indirect segment count mismatch"
            );
            return Ok(false);
        }
        // A request this large can never fit the pool; failing beats
        // parking forever.
        if preq.segments.len() + refs.len() > self.pools.segment_capacity() {
            warn!(device = %self.shared.name, refs = refs.len(), "request exceeds segment pool");
            return Ok(false);
        }

        let Some(segments) = self.pools.reserve_segments(refs.len()) else {
            return Err(());
        };
        preq.indirect_segments = segments;

        for (i, gref) in refs.iter().enumerate() {
            let write = if iso && i == 0 { true } else { dir_in };
            match self.grants.map(*gref, write) {
                Ok(mapped) => preq.indirect_segments[i].mapped = Some(mapped),
                Err(err) => {
                    warn!(device = %self.shared.name, %err, "indirect map failed");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Error response for a request that never allocated anything.
    fn fail_plain(&self, id: u64, pid: PendingId) -> Outcome {
        self.shared
            .make_response(id, 0, 0, TransferStatus::InvalidArgument);
        self.pools.release_pending_unused(pid);
        Outcome::Done
    }

    /// Unwind a partially built request and answer with an error.
    fn fail_urb(&self, mut preq: PendingRequest) -> Outcome {
        let id = preq.ring_id;
        fast_flush(&self.grants, &mut preq);
        self.pools.release_segments(&mut preq.segments);
        self.pools.release_segments(&mut preq.indirect_segments);
        self.pools.release_pending_unused(preq.pending_id);
        self.shared
            .make_response(id, 0, 0, TransferStatus::InvalidArgument);
        Outcome::Done
    }

    fn teardown(&mut self) {
        debug!(device = %self.shared.name, "dispatcher shutting down");
        self.shared.canceling.store(true, Ordering::Release);
        self.native.flush();
        self.shared.wait_idle();

        // Anything still parked or unconsumed gets a terminal status so
        // the frontend's flush cannot hang.
        if let Some((pid, req)) = self.parked.take() {
            self.shared.make_response(req.id, 0, 0, TransferStatus::Shutdown);
            self.pools.release_pending_unused(pid);
        }
        loop {
            let consumed = self.shared.ring.lock().consume_request();
            match consumed {
                Ok(Some(req)) => {
                    self.shared
                        .make_response(req.id, 0, 0, TransferStatus::Shutdown)
                }
                Ok(None) | Err(_) => break,
            }
        }

        let stats = self.shared.stats.lock();
        info!(
            device = %self.shared.name,
            oo = stats.oo_req,
            in_reqs = stats.in_req,
            out_reqs = stats.out_req,
            cntrl = stats.cntrl_req,
            isoc = stats.isoc_req,
            bulk = stats.bulk_req,
            int = stats.int_req,
            ind = stats.ind_req,
            err = stats.errors,
            rst = stats.resets,
            "dispatcher stopped"
        );
    }
}
