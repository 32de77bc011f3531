//! Virtual root-hub ports
//!
//! Port state and status bits for the virtual host controller. The status
//! word follows the USB hub convention: current status in the low half,
//! change bits in the high half.

use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;

use common::Doorbell;
use protocol::{DeviceId, DeviceSpeed};

use crate::device::VirtualDevice;
use std::sync::Arc;

pub const PORT_STAT_CONNECTION: u32 = 0x0001;
pub const PORT_STAT_ENABLE: u32 = 0x0002;
pub const PORT_STAT_RESET: u32 = 0x0010;
pub const PORT_STAT_POWER: u32 = 0x0100;
pub const PORT_STAT_LOW_SPEED: u32 = 0x0200;
pub const PORT_STAT_HIGH_SPEED: u32 = 0x0400;

pub const PORT_STAT_C_CONNECTION: u32 = PORT_STAT_CONNECTION << 16;
pub const PORT_STAT_C_RESET: u32 = PORT_STAT_RESET << 16;

/// Lifecycle of one port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Nothing attached.
    Empty,
    /// Device creation and speed negotiation in progress.
    Connecting,
    /// Device attached and usable.
    Present,
    /// Teardown in progress; no new work.
    Closing,
}

/// Status bit for a negotiated speed.
pub(crate) fn speed_status_bit(speed: DeviceSpeed) -> u32 {
    match speed {
        DeviceSpeed::Low => PORT_STAT_LOW_SPEED,
        DeviceSpeed::Full => 0,
        DeviceSpeed::High | DeviceSpeed::Super => PORT_STAT_HIGH_SPEED,
    }
}

pub(crate) struct PortSlot {
    pub state: PortState,
    pub status: u32,
    /// Jobs currently touching this port's device; teardown waits for
    /// zero.
    pub processing: u32,
    pub device: Option<Arc<VirtualDevice>>,
    pub device_id: Option<DeviceId>,
    /// One-shot gate: at most one reset in flight per port.
    pub reset_pending: AtomicBool,
    pub reset_done: bool,
    /// Notification and worker threads, joined at teardown.
    pub threads: Vec<JoinHandle<()>>,
    /// Closes the interrupt doorbell to stop the notification thread.
    pub interrupt_stop: Option<Doorbell>,
}

impl PortSlot {
    pub fn new() -> PortSlot {
        PortSlot {
            state: PortState::Empty,
            status: 0,
            processing: 0,
            device: None,
            device_id: None,
            reset_pending: AtomicBool::new(false),
            reset_done: false,
            threads: Vec::new(),
            interrupt_stop: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_bits() {
        assert_eq!(speed_status_bit(DeviceSpeed::Low), PORT_STAT_LOW_SPEED);
        assert_eq!(speed_status_bit(DeviceSpeed::Full), 0);
        assert_eq!(speed_status_bit(DeviceSpeed::High), PORT_STAT_HIGH_SPEED);
        assert_eq!(speed_status_bit(DeviceSpeed::Super), PORT_STAT_HIGH_SPEED);
    }

    #[test]
    fn change_bits_live_in_the_high_half() {
        assert_eq!(PORT_STAT_C_CONNECTION, 0x0001_0000);
        assert_eq!(PORT_STAT_C_RESET, 0x0010_0000);
    }
}
