//! Core identifier and USB type definitions
//!
//! Small `Copy` newtypes and enums shared by both sides of the transport.

use byteorder::{ByteOrder, LittleEndian};

/// Identifier for a connected device, assigned by whoever drives the
/// connect/disconnect channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// Caller-assigned identifier for one logical transfer
///
/// Each transfer handed to the controller must carry a unique id so the
/// completed transfer can be matched by the caller (typically generated
/// from an atomic counter). This is distinct from the ring slot id, which
/// is owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(pub u64);

/// Reference to a granted page
///
/// Issued by the grant table when a page is exposed to the peer; `0` is
/// never a valid reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GrantRef(pub u32);

impl GrantRef {
    /// The reserved invalid reference.
    pub const INVALID: GrantRef = GrantRef(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Direction bit in an endpoint address (set = IN, device to host).
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Mask extracting the endpoint number from an endpoint address.
pub const ENDPOINT_NUMBER_MASK: u8 = 0x0f;

/// Transfer kind carried in a request slot
///
/// The first four are USB transfer types executed against the native
/// stack; the rest are internal commands answered from dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransferKind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
    Reset = 4,
    AbortPipe = 5,
    GetFrame = 6,
    GetSpeed = 7,
    Cancel = 8,
}

impl TransferKind {
    /// Highest valid wire value.
    pub const MAX: u8 = TransferKind::Cancel as u8;

    /// Decode a wire value; anything past `MAX` is rejected.
    pub fn from_wire(raw: u8) -> Option<TransferKind> {
        Some(match raw {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            3 => TransferKind::Interrupt,
            4 => TransferKind::Reset,
            5 => TransferKind::AbortPipe,
            6 => TransferKind::GetFrame,
            7 => TransferKind::GetSpeed,
            8 => TransferKind::Cancel,
            _ => return None,
        })
    }

    /// True for kinds that submit I/O to the native stack.
    pub fn is_urb(self) -> bool {
        (self as u8) <= (TransferKind::Interrupt as u8)
    }

    /// True for internal commands answered synchronously by the dispatcher.
    pub fn is_internal(self) -> bool {
        !self.is_urb()
    }
}

/// Device speed as reported by the internal GET_SPEED command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DeviceSpeed {
    Low = 1,
    Full = 2,
    High = 3,
    Super = 4,
}

impl DeviceSpeed {
    pub fn from_wire(raw: u32) -> Option<DeviceSpeed> {
        Some(match raw {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            4 => DeviceSpeed::Super,
            _ => return None,
        })
    }
}

/// Standard request: SET_ADDRESS.
pub const REQ_SET_ADDRESS: u8 = 0x05;
/// Standard request: GET_DESCRIPTOR.
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
/// Descriptor type: device descriptor (wValue high byte).
pub const DESC_DEVICE: u8 = 0x01;

/// An eight-byte USB setup packet
///
/// Packed little-endian into the `setup` field of a control request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// True if the data stage moves device to host.
    pub fn is_dir_in(&self) -> bool {
        self.request_type & ENDPOINT_DIR_IN != 0
    }

    /// Pack into the slot's `setup` field.
    pub fn pack(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[0] = self.request_type;
        buf[1] = self.request;
        LittleEndian::write_u16(&mut buf[2..4], self.value);
        LittleEndian::write_u16(&mut buf[4..6], self.index);
        LittleEndian::write_u16(&mut buf[6..8], self.length);
        LittleEndian::read_u64(&buf)
    }

    /// Unpack from the slot's `setup` field.
    pub fn unpack(raw: u64) -> SetupPacket {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, raw);
        SetupPacket {
            request_type: buf[0],
            request: buf[1],
            value: LittleEndian::read_u16(&buf[2..4]),
            index: LittleEndian::read_u16(&buf[4..6]),
            length: LittleEndian::read_u16(&buf[6..8]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_kind_wire_roundtrip() {
        for raw in 0..=TransferKind::MAX {
            let kind = TransferKind::from_wire(raw).expect("valid kind");
            assert_eq!(kind as u8, raw);
        }
        assert_eq!(TransferKind::from_wire(TransferKind::MAX + 1), None);
        assert_eq!(TransferKind::from_wire(0xff), None);
    }

    #[test]
    fn urb_vs_internal_split() {
        assert!(TransferKind::Control.is_urb());
        assert!(TransferKind::Isochronous.is_urb());
        assert!(TransferKind::Bulk.is_urb());
        assert!(TransferKind::Interrupt.is_urb());
        assert!(TransferKind::Reset.is_internal());
        assert!(TransferKind::Cancel.is_internal());
        assert!(TransferKind::GetSpeed.is_internal());
    }

    #[test]
    fn setup_packet_pack_unpack() {
        let setup = SetupPacket {
            request_type: 0x80,
            request: REQ_GET_DESCRIPTOR,
            value: (DESC_DEVICE as u16) << 8,
            index: 0,
            length: 18,
        };
        let packed = setup.pack();
        assert_eq!(SetupPacket::unpack(packed), setup);
        assert!(setup.is_dir_in());
    }

    #[test]
    fn invalid_grant_ref() {
        assert!(!GrantRef::INVALID.is_valid());
        assert!(GrantRef(1).is_valid());
    }
}
