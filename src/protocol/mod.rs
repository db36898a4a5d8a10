//! Wire protocol for the hand's motor controller
//!
//! Packet format:
//!
//! ```text
//! [0x4D 0x4C] [INDEX:u8] [ADDRESS:u8] [LEN:u16 LE] [PAYLOAD..] [CS1:u8] [CS2:u8]
//! ```
//!
//! The address byte carries two fields: the low nibble selects the function
//! ([`Opcode`]), the high nibble selects the motor channel (0-8, or
//! [`ALL_CHANNELS`] to act on every channel at once). Checksums are computed
//! over the payload only: `CS1` is the two's complement of the byte sum,
//! `CS2` the XOR of all payload bytes, so a verifier that adds respectively
//! XORs the payload back in must end up at zero for both.

mod framer;

pub use framer::{encode_packet, payload_checksums, PacketReceiver};

use crate::codec::{ByteBuffer, Decode, Encode};

/// Header sync byte 1
pub const PACKET_HEADER1: u8 = 0x4D;
/// Header sync byte 2
pub const PACKET_HEADER2: u8 = 0x4C;

/// Frame overhead in bytes: header (2) + index (1) + address (1) + length (2)
/// + checksums (2).
pub const PACKET_OVERHEAD: usize = 8;

/// Outgoing payloads are padded to this size; the controller firmware expects
/// fixed-length frames from the host.
pub const TX_PAYLOAD_SIZE: usize = 64;

/// Channel nibble that addresses every channel at once.
pub const ALL_CHANNELS: u8 = 0xF;

/// Function selector in the low nibble of the address byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Request position and current of a channel (zero payload request; the
    /// reply carries the feedback record)
    GetControlFeedback = 0x0,
    /// Set the target position of a channel; acknowledged with fresh feedback
    SetControlCommand = 0x1,
    /// Request the active position controller settings
    GetPositionSettings = 0x2,
    /// Set new position controller settings
    SetPositionSettings = 0x3,
    /// Request the active current controller settings
    GetCurrentSettings = 0x4,
    /// Set new current controller settings
    SetCurrentSettings = 0x5,
    /// Request the controller state (enabled channels, faults)
    GetControllerState = 0x6,
    /// Set a new controller state (enable channels, clear faults)
    SetControllerState = 0x7,
    /// Request the encoder scaling values
    GetEncoderValues = 0x8,
    /// Set new encoder scaling values
    SetEncoderValues = 0x9,
}

impl Opcode {
    /// Decode the low nibble of an address byte.
    pub fn from_nibble(nibble: u8) -> Option<Opcode> {
        match nibble {
            0x0 => Some(Opcode::GetControlFeedback),
            0x1 => Some(Opcode::SetControlCommand),
            0x2 => Some(Opcode::GetPositionSettings),
            0x3 => Some(Opcode::SetPositionSettings),
            0x4 => Some(Opcode::GetCurrentSettings),
            0x5 => Some(Opcode::SetCurrentSettings),
            0x6 => Some(Opcode::GetControllerState),
            0x7 => Some(Opcode::SetControllerState),
            0x8 => Some(Opcode::GetEncoderValues),
            0x9 => Some(Opcode::SetEncoderValues),
            _ => None,
        }
    }
}

/// One framed message to or from the motor controller.
///
/// The index is a free-running counter stamped by the serial interface when
/// the packet is sent; the hardware copies it back into its reply, which makes
/// it useful for debugging but nothing else.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerialPacket {
    pub index: u8,
    pub address: u8,
    pub data: Vec<u8>,
}

impl SerialPacket {
    pub fn new(address: u8, data: Vec<u8>) -> Self {
        SerialPacket {
            index: 0,
            address,
            data,
        }
    }

    /// Pack an opcode and a channel nibble into an address byte.
    pub fn address_for(opcode: Opcode, channel: u8) -> u8 {
        (channel << 4) | opcode as u8
    }

    /// The function selector (low nibble of the address).
    pub fn opcode_nibble(&self) -> u8 {
        self.address & 0x0F
    }

    /// The addressed channel (high nibble of the address).
    pub fn channel_nibble(&self) -> u8 {
        self.address >> 4
    }
}

impl Encode for SerialPacket {
    fn encode(&self, buf: &mut ByteBuffer) {
        buf.put(self.index);
        buf.put(self.address);
        buf.put(self.data.len() as u16);
        buf.put_bytes(&self.data);
    }
}

impl Decode for SerialPacket {
    fn decode(buf: &mut ByteBuffer) -> Self {
        let index = buf.take::<u8>();
        let address = buf.take::<u8>();
        let size = buf.take::<u16>();
        let data = buf.take_bytes(size as usize);
        SerialPacket {
            index,
            address,
            data,
        }
    }
}
