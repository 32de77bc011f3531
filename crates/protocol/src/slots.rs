//! Ring slot layout
//!
//! Request and response slots published through the shared transport ring.
//! One slot is written entirely by its producer before the producer index
//! is advanced, so both types are plain `Copy` data with no interior
//! synchronization.

use crate::status::TransferStatus;
use crate::types::{
    ENDPOINT_DIR_IN, ENDPOINT_NUMBER_MASK, GrantRef, SetupPacket, TransferKind,
};
use crate::MAX_SEGMENTS_PER_REQUEST;

/// Allow short IN transfers to complete without error.
pub const FLAG_SHORT_OK: u8 = 0x01;
/// Treat this request as a device reset regardless of kind.
pub const FLAG_RESET: u8 = 0x02;
/// Start an isochronous request on the next available frame.
pub const FLAG_ASAP: u8 = 0x04;
/// The segment array references indirect descriptor pages.
pub const FLAG_INDIRECT: u8 = 0x08;
/// Force re-enumeration of the device.
pub const FLAG_CYCLE_PORT: u8 = 0x10;
/// The segment array carries inline data instead of grant references.
pub const FLAG_DIRECT_DATA: u8 = 0x20;

/// One request slot on the transport ring
///
/// `id` is the slot identity: it is assigned once from `[0, RING_CAPACITY)`
/// when the shadow pool is built and echoed back in the matching response.
/// The `kind` byte is raw on purpose; the consumer must decode it with
/// [`RingRequest::kind`] before trusting it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RingRequest {
    pub id: u64,
    pub setup: u64,
    pub kind: u8,
    pub endpoint: u8,
    pub offset: u16,
    pub length: u32,
    pub nr_segments: u8,
    pub flags: u8,
    pub nr_packets: u16,
    pub start_frame: u32,
    pub segments: [GrantRef; MAX_SEGMENTS_PER_REQUEST],
}

impl RingRequest {
    /// A zeroed request owning the given slot id.
    pub fn empty(id: u64) -> RingRequest {
        RingRequest {
            id,
            setup: 0,
            kind: 0,
            endpoint: 0,
            offset: 0,
            length: 0,
            nr_segments: 0,
            flags: 0,
            nr_packets: 0,
            start_frame: 0,
            segments: [GrantRef::INVALID; MAX_SEGMENTS_PER_REQUEST],
        }
    }

    /// Decode the transfer kind; `None` for values off the wire enum.
    pub fn kind(&self) -> Option<TransferKind> {
        TransferKind::from_wire(self.kind)
    }

    pub fn is_dir_in(&self) -> bool {
        self.endpoint & ENDPOINT_DIR_IN != 0
    }

    pub fn endpoint_number(&self) -> u8 {
        self.endpoint & ENDPOINT_NUMBER_MASK
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_indirect(&self) -> bool {
        self.has_flag(FLAG_INDIRECT)
    }

    pub fn is_short_ok(&self) -> bool {
        self.has_flag(FLAG_SHORT_OK)
    }

    pub fn is_asap(&self) -> bool {
        self.has_flag(FLAG_ASAP)
    }

    /// Reset is requested either by kind or by flag.
    pub fn wants_reset(&self) -> bool {
        self.has_flag(FLAG_RESET) || self.kind() == Some(TransferKind::Reset)
    }

    pub fn wants_cycle_port(&self) -> bool {
        self.has_flag(FLAG_CYCLE_PORT)
    }

    /// Control transfers and OUT transfers get a watchdog timer; IN
    /// transfers may legitimately sit until the device produces data.
    pub fn wants_timeout(&self) -> bool {
        self.kind() == Some(TransferKind::Control) || !self.is_dir_in()
    }

    /// The setup packet of a control request.
    pub fn setup_packet(&self) -> SetupPacket {
        SetupPacket::unpack(self.setup)
    }

    /// Inline payload carried in place of the segment array
    ///
    /// Used with `FLAG_DIRECT_DATA` by internal commands; the cancel
    /// command stores the ring id of the request to shoot down.
    pub fn inline_data(&self) -> u64 {
        (self.segments[0].0 as u64) | ((self.segments[1].0 as u64) << 32)
    }

    /// Store an inline payload over the start of the segment array.
    pub fn set_inline_data(&mut self, data: u64) {
        self.segments[0] = GrantRef(data as u32);
        self.segments[1] = GrantRef((data >> 32) as u32);
    }
}

/// One response slot on the transport ring
///
/// `data` is secondary result data: the frame number for GET_FRAME and
/// ASAP isochronous completions, the device speed for GET_SPEED.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RingResponse {
    pub id: u64,
    pub actual_length: u32,
    pub data: u32,
    pub status: i16,
}

impl RingResponse {
    pub fn new(id: u64, actual_length: u32, data: u32, status: TransferStatus) -> RingResponse {
        RingResponse {
            id,
            actual_length,
            data,
            status: status.to_wire(),
        }
    }

    /// Decoded status; unrecognized wire values read as `Unknown`.
    pub fn status(&self) -> TransferStatus {
        TransferStatus::from_wire(self.status)
    }
}

impl Default for RingResponse {
    fn default() -> Self {
        RingResponse::new(0, 0, 0, TransferStatus::Ok)
    }
}
