//! Transfer status codes
//!
//! Device-independent status enumeration carried in response slots. The
//! backend maps whatever its native USB stack reports onto these; the wire
//! form is a negative `i16` with `Ok` at zero, and `Unknown` is the only
//! catch-all when decoding.

use std::fmt;

/// Base wire value for USB-level errors.
const WIRE_USB_ERROR: i16 = -10;

/// Result of one transfer as seen on the response ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    /// Completed successfully.
    Ok,
    /// Unlinked before completion.
    Canceled,
    /// Still in progress (never a terminal wire status).
    Pending,
    /// Bit stuffing or other low-level protocol error.
    Protocol,
    /// CRC mismatch.
    Crc,
    /// Timed out.
    Timeout,
    /// Endpoint stalled.
    Stalled,
    /// IN buffer overrun.
    InBufferOverrun,
    /// OUT buffer underrun.
    OutBufferUnderrun,
    /// Too much data for the buffer.
    Overflow,
    /// Short packet detected on a transfer that did not allow it.
    ShortPacket,
    /// Device removed.
    DeviceRemoved,
    /// Partial isochronous completion.
    PartialIso,
    /// Malformed request.
    InvalidArgument,
    /// Unlinked asynchronously (connection reset).
    Reset,
    /// Device or transport shut down.
    Shutdown,
    /// Anything the mapping does not recognize.
    Unknown,
}

impl TransferStatus {
    pub fn is_ok(self) -> bool {
        self == TransferStatus::Ok
    }

    /// Encode for the response slot.
    pub fn to_wire(self) -> i16 {
        match self {
            TransferStatus::Ok => 0,
            TransferStatus::Canceled => WIRE_USB_ERROR - 1,
            TransferStatus::Pending => WIRE_USB_ERROR - 2,
            TransferStatus::Protocol => WIRE_USB_ERROR - 3,
            TransferStatus::Crc => WIRE_USB_ERROR - 4,
            TransferStatus::Timeout => WIRE_USB_ERROR - 5,
            TransferStatus::Stalled => WIRE_USB_ERROR - 6,
            TransferStatus::InBufferOverrun => WIRE_USB_ERROR - 7,
            TransferStatus::OutBufferUnderrun => WIRE_USB_ERROR - 8,
            TransferStatus::Overflow => WIRE_USB_ERROR - 9,
            TransferStatus::ShortPacket => WIRE_USB_ERROR - 10,
            TransferStatus::DeviceRemoved => WIRE_USB_ERROR - 11,
            TransferStatus::PartialIso => WIRE_USB_ERROR - 12,
            TransferStatus::InvalidArgument => WIRE_USB_ERROR - 13,
            TransferStatus::Reset => WIRE_USB_ERROR - 14,
            TransferStatus::Shutdown => WIRE_USB_ERROR - 15,
            TransferStatus::Unknown => WIRE_USB_ERROR - 16,
        }
    }

    /// Decode from the response slot; unrecognized values become `Unknown`.
    pub fn from_wire(raw: i16) -> TransferStatus {
        match raw {
            0 => TransferStatus::Ok,
            -11 => TransferStatus::Canceled,
            -12 => TransferStatus::Pending,
            -13 => TransferStatus::Protocol,
            -14 => TransferStatus::Crc,
            -15 => TransferStatus::Timeout,
            -16 => TransferStatus::Stalled,
            -17 => TransferStatus::InBufferOverrun,
            -18 => TransferStatus::OutBufferUnderrun,
            -19 => TransferStatus::Overflow,
            -20 => TransferStatus::ShortPacket,
            -21 => TransferStatus::DeviceRemoved,
            -22 => TransferStatus::PartialIso,
            -23 => TransferStatus::InvalidArgument,
            -24 => TransferStatus::Reset,
            -25 => TransferStatus::Shutdown,
            _ => TransferStatus::Unknown,
        }
    }

    /// Human-readable status message for logs.
    pub fn message(self) -> &'static str {
        match self {
            TransferStatus::Ok => "success",
            TransferStatus::Canceled => "unlinked (sync)",
            TransferStatus::Pending => "pending",
            TransferStatus::Protocol => "bit stuffing or unknown USB error",
            TransferStatus::Crc => "CRC mismatch",
            TransferStatus::Timeout => "timed out",
            TransferStatus::Stalled => "endpoint stalled",
            TransferStatus::InBufferOverrun => "IN buffer overrun",
            TransferStatus::OutBufferUnderrun => "OUT buffer underrun",
            TransferStatus::Overflow => "too much data",
            TransferStatus::ShortPacket => "short packet detected",
            TransferStatus::DeviceRemoved => "device removed",
            TransferStatus::PartialIso => "partial isochronous transfer",
            TransferStatus::InvalidArgument => "invalid argument",
            TransferStatus::Reset => "unlinked (async)",
            TransferStatus::Shutdown => "device shut down",
            TransferStatus::Unknown => "unknown status",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
