//! Guest-side virtual host controller for rust-pv-usb
//!
//! Presents N virtual ports and a generic transfer API on top of the
//! shared-ring transport. Transfers are tracked through shadow slots
//! bound to ring ids; completion, cancellation and port lifecycle all
//! resolve through the response path, and finished transfers are handed
//! back on an event channel outside every lock.

pub mod controller;
pub mod device;
pub mod port;
pub mod shadow;
pub mod transfer;

pub use controller::{EnqueueError, HcdEvent, PortError, VirtualHcd};
pub use device::VirtualDevice;
pub use port::{
    PORT_STAT_C_CONNECTION, PORT_STAT_C_RESET, PORT_STAT_CONNECTION, PORT_STAT_ENABLE,
    PORT_STAT_HIGH_SPEED, PORT_STAT_LOW_SPEED, PORT_STAT_POWER, PORT_STAT_RESET, PortState,
};
pub use transfer::{TransferBuffer, TransferRequest, TransferState};
