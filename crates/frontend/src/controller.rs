//! Virtual host controller
//!
//! Exposes N virtual ports and the generic enqueue/dequeue transfer API.
//! The connect/disconnect notification channel drives the port lifecycle:
//! `on_connect` takes a port from EMPTY through CONNECTING to PRESENT,
//! `on_disconnect` through CLOSING back to EMPTY. Completed transfers and
//! port status changes are reported on one event channel.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use common::{FrontLink, doorbell};
use protocol::{DeviceId, DeviceSpeed, TransferId, TransferStatus};

use crate::device::VirtualDevice;
use crate::port::{
    PORT_STAT_C_CONNECTION, PORT_STAT_C_RESET, PORT_STAT_CONNECTION, PORT_STAT_ENABLE,
    PORT_STAT_POWER, PortSlot, PortState, speed_status_bit,
};
use crate::transfer::TransferRequest;

/// How long a reset worker waits for the reset response.
const RESET_WAIT: Duration = Duration::from_secs(5);

/// Events delivered to the controller's caller
#[derive(Debug)]
pub enum HcdEvent {
    /// A transfer reached a terminal state; status and results are
    /// filled in. Delivered exactly once per transfer, outside all locks.
    TransferComplete(Box<TransferRequest>),
    /// A port's status word changed; re-poll hub state.
    PortStatusChanged { port: u8, status: u32 },
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("no such port")]
    InvalidPort,
    #[error("no device attached")]
    NotAttached,
    #[error("port shutting down")]
    Shutdown,
    /// Shadow pool at its floor; retry after completions drain. Carries
    /// the transfer back untouched.
    #[error("transport busy, retry")]
    Retry(Box<TransferRequest>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no such port")]
    InvalidPort,
    #[error("no device attached")]
    NotAttached,
    #[error("port busy")]
    Busy,
    #[error("port shutting down")]
    Shutdown,
    #[error("transfer not found")]
    NotFound,
    #[error("device did not answer the speed query")]
    SpeedQuery,
}

struct HcdInner {
    running: bool,
    ports: Vec<PortSlot>,
}

/// The virtual host controller
pub struct VirtualHcd {
    inner: Mutex<HcdInner>,
    cv: Condvar,
    events: async_channel::Sender<HcdEvent>,
    port_count: usize,
}

impl VirtualHcd {
    /// Create a controller with `ports` virtual ports; the receiver gets
    /// every completion and port-status event.
    pub fn new(ports: usize) -> (Arc<VirtualHcd>, async_channel::Receiver<HcdEvent>) {
        assert!(ports > 0 && ports <= u8::MAX as usize);
        let (events, events_rx) = async_channel::unbounded();
        let hcd = Arc::new(VirtualHcd {
            inner: Mutex::new(HcdInner {
                running: true,
                ports: (0..ports).map(|_| PortSlot::new()).collect(),
            }),
            cv: Condvar::new(),
            events,
            port_count: ports,
        });
        (hcd, events_rx)
    }

    pub fn port_count(&self) -> usize {
        self.port_count
    }

    pub fn port_state(&self, port: u8) -> Result<PortState, PortError> {
        let idx = self.port_index(port)?;
        Ok(self.inner.lock().ports[idx].state)
    }

    pub fn port_status(&self, port: u8) -> Result<u32, PortError> {
        let idx = self.port_index(port)?;
        Ok(self.inner.lock().ports[idx].status)
    }

    /// The device attached to a port, if any.
    pub fn device(&self, port: u8) -> Option<Arc<VirtualDevice>> {
        let idx = self.port_index(port).ok()?;
        self.inner.lock().ports[idx].device.clone()
    }

    /// Clear change bits acknowledged by the hub caller.
    pub fn clear_port_changes(&self, port: u8, mask: u32) -> Result<(), PortError> {
        let idx = self.port_index(port)?;
        self.inner.lock().ports[idx].status &= !(mask & 0xffff_0000);
        Ok(())
    }

    // ---------------------------------------------------------------
    // Lifecycle

    /// Attach a device: EMPTY -> CONNECTING -> PRESENT.
    ///
    /// Blocks briefly for the internal speed query; returns the
    /// negotiated speed.
    pub fn on_connect(
        self: &Arc<Self>,
        port: u8,
        device_id: DeviceId,
        link: FrontLink,
    ) -> Result<DeviceSpeed, PortError> {
        let idx = self.port_index(port)?;
        {
            let mut inner = self.inner.lock();
            if !inner.running {
                return Err(PortError::Shutdown);
            }
            let slot = &mut inner.ports[idx];
            if slot.state != PortState::Empty {
                return Err(PortError::Busy);
            }
            slot.state = PortState::Connecting;
            slot.device_id = Some(device_id);
            slot.status = PORT_STAT_POWER;
        }
        self.emit_port_status(port);
        info!(port, device = device_id.0, "device connecting");

        let FrontLink {
            ring,
            grants,
            notify,
            interrupt,
            interrupt_wake,
        } = link;
        let (work_bell, work_wait) = doorbell();
        let vdev = VirtualDevice::new(port, ring, grants, notify, work_bell, self.events.clone());

        // Notification thread: short, non-blocking handler that drains
        // responses and defers the rest to the worker.
        let intr = {
            let hcd = Arc::clone(self);
            let dev = Arc::clone(&vdev);
            std::thread::Builder::new()
                .name(format!("vusb-intr-{port}"))
                .spawn(move || {
                    while interrupt.wait() {
                        let summary = dev.on_notify();
                        if summary.reset_completed {
                            hcd.finish_reset(port);
                        }
                        dev.work.signal();
                    }
                    debug!(port, "notification thread stopped");
                })
                .expect("spawn notification thread")
        };

        // Deferred worker: fix-ups, retries and giveback.
        let worker = {
            let hcd = Arc::clone(self);
            let dev = Arc::clone(&vdev);
            std::thread::Builder::new()
                .name(format!("vusb-work-{port}"))
                .spawn(move || {
                    while work_wait.wait() {
                        if hcd.start_processing(port) {
                            dev.process();
                            hcd.stop_processing(port);
                        }
                    }
                    debug!(port, "device worker stopped");
                })
                .expect("spawn device worker")
        };

        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.ports[idx];
            slot.device = Some(Arc::clone(&vdev));
            slot.threads = vec![intr, worker];
            slot.interrupt_stop = Some(interrupt_wake);
        }

        let speed = match vdev.query_speed() {
            Ok(speed) => speed,
            Err(()) => {
                error!(port, "speed query failed; tearing the port back down");
                self.teardown_port(port, &vdev);
                return Err(PortError::SpeedQuery);
            }
        };

        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.ports[idx];
            slot.state = PortState::Present;
            slot.status |= PORT_STAT_CONNECTION
                | PORT_STAT_ENABLE
                | speed_status_bit(speed)
                | PORT_STAT_C_CONNECTION;
        }
        self.emit_port_status(port);
        info!(port, ?speed, "device present");
        Ok(speed)
    }

    /// Detach a device: PRESENT -> CLOSING -> EMPTY.
    ///
    /// Halts new work, flushes in-flight transfers (surfacing them with
    /// `Shutdown`), waits for processing to stop and frees the device.
    pub fn on_disconnect(&self, port: u8) -> Result<(), PortError> {
        let idx = self.port_index(port)?;
        let vdev = {
            let mut inner = self.inner.lock();
            let slot = &mut inner.ports[idx];
            match slot.state {
                PortState::Present | PortState::Connecting => {}
                PortState::Closing => return Err(PortError::Shutdown),
                PortState::Empty => return Err(PortError::NotAttached),
            }
            slot.state = PortState::Closing;
            slot.status &= PORT_STAT_POWER;
            slot.status |= PORT_STAT_C_CONNECTION;
            slot.device.clone().expect("attached port has a device")
        };
        self.emit_port_status(port);
        info!(port, "device closing");

        self.teardown_port(port, &vdev);

        self.emit_port_status(port);
        info!(port, "port empty");
        Ok(())
    }

    fn teardown_port(&self, port: u8, vdev: &Arc<VirtualDevice>) {
        let idx = port as usize - 1;

        // Flush the ring: everything in flight resolves or is surfaced
        // with Shutdown.
        vdev.shutdown_flush();

        // Wait for every job touching the device to drain, then flush
        // once more for anything a straggling job queued mid-teardown.
        self.wait_stop_processing(port);
        vdev.shutdown_flush();

        // Stop and join the device threads.
        let (threads, interrupt_stop) = {
            let mut inner = self.inner.lock();
            let slot = &mut inner.ports[idx];
            (
                std::mem::take(&mut slot.threads),
                slot.interrupt_stop.take(),
            )
        };
        vdev.work.close();
        if let Some(stop) = interrupt_stop {
            stop.close();
        }
        for thread in threads {
            let _ = thread.join();
        }

        let (free, in_use) = vdev.shadow_counts();
        if in_use != 0 {
            warn!(port, free, in_use, "shadows leaked across teardown");
        }

        let mut inner = self.inner.lock();
        let slot = &mut inner.ports[idx];
        slot.device = None;
        slot.device_id = None;
        slot.state = PortState::Empty;
        slot.status = 0;
        slot.reset_done = false;
        slot.reset_pending.store(false, Ordering::Release);
    }

    /// Tear down every attached port; the controller stops accepting
    /// connections.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            inner.running = false;
        }
        for port in 1..=self.port_count as u8 {
            let attached = {
                let inner = self.inner.lock();
                !matches!(inner.ports[port as usize - 1].state, PortState::Empty)
            };
            if attached {
                let _ = self.on_disconnect(port);
            }
        }
    }

    // ---------------------------------------------------------------
    // Transfers

    /// Queue one transfer. Never blocks: a starved shadow pool returns
    /// `EnqueueError::Retry` carrying the transfer back.
    pub fn enqueue(&self, port: u8, transfer: TransferRequest) -> Result<(), EnqueueError> {
        let vdev = self.start_port_op(port).map_err(enqueue_port_error)?;
        let result = vdev
            .submit(transfer)
            .map_err(|transfer| EnqueueError::Retry(transfer));
        self.stop_processing(port);
        result
    }

    /// Cancel one queued transfer.
    ///
    /// Not-yet-sent transfers complete immediately; sent ones resolve
    /// through the response path with `Canceled` recorded locally. This
    /// call never completes the transfer itself.
    pub fn dequeue(&self, port: u8, id: TransferId) -> Result<(), PortError> {
        let vdev = self.start_port_op(port)?;
        let found = vdev.cancel(id, TransferStatus::Canceled);
        self.stop_processing(port);
        if found { Ok(()) } else { Err(PortError::NotFound) }
    }

    // ---------------------------------------------------------------
    // Reset

    /// Trigger a port reset. At most one reset is ever in flight per
    /// port; a second request while one is pending returns `Ok(false)`.
    /// The reset itself runs on a dedicated worker, never inline.
    pub fn request_reset(self: &Arc<Self>, port: u8) -> Result<bool, PortError> {
        let idx = self.port_index(port)?;
        {
            let inner = self.inner.lock();
            let slot = &inner.ports[idx];
            match slot.state {
                PortState::Present => {}
                PortState::Closing => return Err(PortError::Shutdown),
                _ => return Err(PortError::NotAttached),
            }
            if slot.reset_pending.swap(true, Ordering::AcqRel) {
                return Ok(false);
            }
        }

        let hcd = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("vusb-reset-{port}"))
            .spawn(move || hcd.run_port_reset(port))
            .expect("spawn reset worker");
        Ok(true)
    }

    fn run_port_reset(self: Arc<Self>, port: u8) {
        let idx = port as usize - 1;
        let Ok(vdev) = self.start_port_op(port) else {
            self.inner.lock().ports[idx]
                .reset_pending
                .store(false, Ordering::Release);
            return;
        };

        if vdev.submit_reset().is_err() {
            warn!(port, "no shadow for reset command");
            let mut inner = self.inner.lock();
            inner.ports[idx].reset_pending.store(false, Ordering::Release);
            drop(inner);
            self.stop_processing(port);
            return;
        }

        // Block until the notification thread sees the reset response.
        let deadline = Instant::now() + RESET_WAIT;
        let completed = {
            let mut inner = self.inner.lock();
            loop {
                if inner.ports[idx].reset_done {
                    break true;
                }
                if self.cv.wait_until(&mut inner, deadline).timed_out() {
                    break false;
                }
            }
        };

        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.ports[idx];
            slot.reset_done = false;
            slot.reset_pending.store(false, Ordering::Release);
            if completed {
                slot.status |= PORT_STAT_C_RESET;
            }
        }

        if completed {
            info!(port, "reset complete");
            self.emit_port_status(port);
        } else {
            warn!(port, "reset timed out");
        }
        self.stop_processing(port);
    }

    /// Force re-enumeration of the device on `port`.
    pub fn request_cycle(&self, port: u8) -> Result<(), PortError> {
        let vdev = self.start_port_op(port)?;
        let result = vdev.submit_cycle();
        self.stop_processing(port);
        result.map_err(|()| PortError::Busy)
    }

    /// Called from the notification thread when the reset response lands.
    pub(crate) fn finish_reset(&self, port: u8) {
        let idx = port as usize - 1;
        {
            let mut inner = self.inner.lock();
            inner.ports[idx].reset_done = true;
        }
        self.cv.notify_all();
    }

    // ---------------------------------------------------------------
    // Processing gate

    /// Take the processing gate for a port; refuses when the device is
    /// absent or closing.
    pub(crate) fn start_processing(&self, port: u8) -> bool {
        let Ok(idx) = self.port_index(port) else {
            return false;
        };
        let mut inner = self.inner.lock();
        if !inner.running {
            return false;
        }
        let slot = &mut inner.ports[idx];
        if !matches!(slot.state, PortState::Present | PortState::Connecting) {
            return false;
        }
        slot.processing += 1;
        true
    }

    pub(crate) fn stop_processing(&self, port: u8) {
        let idx = port as usize - 1;
        {
            let mut inner = self.inner.lock();
            let slot = &mut inner.ports[idx];
            debug_assert!(slot.processing > 0);
            slot.processing = slot.processing.saturating_sub(1);
        }
        self.cv.notify_all();
    }

    fn wait_stop_processing(&self, port: u8) {
        let idx = port as usize - 1;
        let mut inner = self.inner.lock();
        while inner.ports[idx].processing > 0 {
            self.cv.wait(&mut inner);
        }
    }

    // ---------------------------------------------------------------
    // Helpers

    fn start_port_op(&self, port: u8) -> Result<Arc<VirtualDevice>, PortError> {
        let idx = self.port_index(port)?;
        let mut inner = self.inner.lock();
        if !inner.running {
            return Err(PortError::Shutdown);
        }
        let slot = &mut inner.ports[idx];
        match slot.state {
            PortState::Present => {}
            PortState::Closing => return Err(PortError::Shutdown),
            _ => return Err(PortError::NotAttached),
        }
        slot.processing += 1;
        Ok(slot.device.clone().expect("present port has a device"))
    }

    /// Ports are numbered from 1, as on a real hub.
    fn port_index(&self, port: u8) -> Result<usize, PortError> {
        if port == 0 || port as usize > self.port_count {
            return Err(PortError::InvalidPort);
        }
        Ok(port as usize - 1)
    }

    fn emit_port_status(&self, port: u8) {
        let status = {
            let inner = self.inner.lock();
            inner.ports[port as usize - 1].status
        };
        let _ = self
            .events
            .try_send(HcdEvent::PortStatusChanged { port, status });
    }
}

fn enqueue_port_error(err: PortError) -> EnqueueError {
    match err {
        PortError::InvalidPort => EnqueueError::InvalidPort,
        PortError::Shutdown => EnqueueError::Shutdown,
        _ => EnqueueError::NotAttached,
    }
}
