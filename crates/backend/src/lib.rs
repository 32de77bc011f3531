//! Host-side transport backend for rust-pv-usb
//!
//! Consumes transfer requests from the shared ring, maps the granted pages
//! they reference, executes them against a native USB device and produces
//! the responses. One dispatcher worker runs per connected device; the
//! pending-request and segment pools are global across devices, and a
//! single reaper worker performs the blocking frees that completion
//! callbacks must not.

pub mod dispatcher;
pub mod mock;
pub mod native;
pub mod pools;
pub mod timeout;

pub use dispatcher::{BackendConfig, BackendContext, DeviceHandle, DispatchStats};
pub use mock::MockDevice;
pub use native::{
    IsoTable, NativeDevice, NativeStatus, ScatterBuffer, Urb, UrbCompletion, UrbResult,
    map_native_status,
};
pub use pools::{BackendPools, PendingId, PendingRequest, Segment, SegmentId};
pub use timeout::{TimeoutScheduler, TimerHandle};
