//! Frame encoding and the receiver state machine
//!
//! Receiving reassembles frames one byte at a time so the caller never has to
//! block for more than a single byte read. The state machine resynchronises
//! on corruption: a wrong byte after the first sync byte falls back to
//! hunting for a header, and a checksum mismatch discards the frame without
//! notifying anyone. Partial frames survive across calls.

use super::{SerialPacket, PACKET_HEADER1, PACKET_HEADER2, PACKET_OVERHEAD};
use crate::codec::{ByteBuffer, Decode, Encode};

/// Compute the payload checksums `(cs1, cs2)`.
///
/// `cs1` is the two's complement of the byte sum, `cs2` the XOR of all
/// payload bytes. Verification adds respectively XORs the payload back in and
/// expects zero for both.
pub fn payload_checksums(data: &[u8]) -> (u8, u8) {
    let mut sum: u8 = 0;
    let mut xor: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
        xor ^= byte;
    }
    (0u8.wrapping_sub(sum), xor)
}

/// Encode a packet into the full wire frame.
pub fn encode_packet(packet: &SerialPacket) -> Vec<u8> {
    let (cs1, cs2) = payload_checksums(&packet.data);
    let mut buf = ByteBuffer::with_capacity(packet.data.len() + PACKET_OVERHEAD);
    buf.put(PACKET_HEADER1);
    buf.put(PACKET_HEADER2);
    packet.encode(&mut buf);
    buf.put(cs1);
    buf.put(cs2);
    buf.into_vec()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveState {
    Header1,
    Header2,
    Index,
    Address,
    Length1,
    Length2,
    Data,
    Checksum1,
    Checksum2,
}

/// Byte-wise frame reassembler.
///
/// Feed every received byte through [`push_byte`]; a completed, verified
/// frame is returned as soon as its second checksum byte arrives.
///
/// [`push_byte`]: PacketReceiver::push_byte
#[derive(Debug)]
pub struct PacketReceiver {
    state: ReceiveState,
    frame: ByteBuffer,
    length: u16,
    data_seen: usize,
    checksum1: u8,
    packets_received: u32,
    skipped_bytes: usize,
}

impl PacketReceiver {
    pub fn new() -> Self {
        PacketReceiver {
            state: ReceiveState::Header1,
            frame: ByteBuffer::new(),
            length: 0,
            data_seen: 0,
            checksum1: 0,
            packets_received: 0,
            skipped_bytes: 0,
        }
    }

    /// Number of frames that passed checksum verification so far.
    pub fn packets_received(&self) -> u32 {
        self.packets_received
    }

    /// Advance the state machine by one byte. Returns the completed packet
    /// when this byte finished a verified frame.
    pub fn push_byte(&mut self, byte: u8) -> Option<SerialPacket> {
        match self.state {
            ReceiveState::Header1 => {
                if byte == PACKET_HEADER1 {
                    self.state = ReceiveState::Header2;
                } else {
                    self.skipped_bytes += 1;
                }
            }
            ReceiveState::Header2 => match byte {
                PACKET_HEADER2 => {
                    self.state = ReceiveState::Index;
                }
                // A repeated first sync byte may still start a frame
                PACKET_HEADER1 => {
                    self.skipped_bytes += 1;
                }
                _ => {
                    self.state = ReceiveState::Header1;
                    self.skipped_bytes += 2;
                }
            },
            ReceiveState::Index => {
                self.frame.reset(0);
                self.frame.put(byte);
                self.state = ReceiveState::Address;
            }
            ReceiveState::Address => {
                self.frame.put(byte);
                self.state = ReceiveState::Length1;
            }
            ReceiveState::Length1 => {
                self.frame.put(byte);
                self.state = ReceiveState::Length2;
            }
            ReceiveState::Length2 => {
                self.frame.put(byte);
                self.length = self.frame.peek_back::<u16>();
                self.data_seen = 0;
                self.state = if self.length == 0 {
                    ReceiveState::Checksum1
                } else {
                    ReceiveState::Data
                };
            }
            ReceiveState::Data => {
                self.frame.put(byte);
                self.data_seen += 1;
                if self.data_seen >= self.length as usize {
                    self.state = ReceiveState::Checksum1;
                }
            }
            ReceiveState::Checksum1 => {
                self.checksum1 = byte;
                self.state = ReceiveState::Checksum2;
            }
            ReceiveState::Checksum2 => {
                self.state = ReceiveState::Header1;
                return self.finish_frame(byte);
            }
        }
        None
    }

    fn finish_frame(&mut self, checksum2: u8) -> Option<SerialPacket> {
        let payload = &self.frame.as_slice()[4..4 + self.length as usize];
        let mut cs1 = self.checksum1;
        let mut cs2 = checksum2;
        for &byte in payload {
            cs1 = cs1.wrapping_add(byte);
            cs2 ^= byte;
        }

        if cs1 != 0 || cs2 != 0 {
            log::warn!(
                "Checksum error ({:#04x}, {:#04x} != 0), dropping {}-byte frame",
                cs1,
                cs2,
                self.length
            );
            self.skipped_bytes = 0;
            return None;
        }

        let packet = SerialPacket::decode(&mut self.frame);
        self.packets_received += 1;

        if self.skipped_bytes > 0 {
            log::debug!("Skipped {} bytes before frame", self.skipped_bytes);
        }
        log::trace!(
            "Received packet index: {}, address: {:#04x}, size: {}",
            packet.index,
            packet.address,
            packet.data.len()
        );
        self.skipped_bytes = 0;

        Some(packet)
    }
}

impl Default for PacketReceiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::types::ControllerFeedback;
    use crate::protocol::Opcode;
    use crate::transport::MockTransport;

    fn feedback_payload(position: i32, current: i16) -> Vec<u8> {
        let mut buf = ByteBuffer::new();
        ControllerFeedback { position, current }.encode(&mut buf);
        buf.into_vec()
    }

    fn feed(receiver: &mut PacketReceiver, bytes: &[u8]) -> Vec<SerialPacket> {
        bytes
            .iter()
            .filter_map(|&byte| receiver.push_byte(byte))
            .collect()
    }

    #[test]
    fn test_feedback_frame_checksums() {
        // Feedback of the pinky wrapped in a control command frame
        let payload = feedback_payload(0, 140);
        let packet = SerialPacket::new(
            SerialPacket::address_for(Opcode::SetControlCommand, 7),
            payload.clone(),
        );
        let bytes = encode_packet(&packet);

        assert_eq!(bytes.len(), payload.len() + PACKET_OVERHEAD);
        let (cs1, cs2) = payload_checksums(&payload);
        assert_eq!(bytes[bytes.len() - 2], cs1);
        assert_eq!(bytes[bytes.len() - 1], cs2);

        // Verification folds the payload back in and must reach zero twice
        let mut sum = cs1;
        let mut xor = cs2;
        for &byte in &payload {
            sum = sum.wrapping_add(byte);
            xor ^= byte;
        }
        assert_eq!(sum, 0);
        assert_eq!(xor, 0);
    }

    #[test]
    fn test_framing_round_trip() {
        let packet = SerialPacket::new(
            SerialPacket::address_for(Opcode::GetPositionSettings, 4),
            vec![1, 2, 3, 4, 5],
        );
        let mut receiver = PacketReceiver::new();
        let received = feed(&mut receiver, &encode_packet(&packet));

        assert_eq!(received, vec![packet]);
        assert_eq!(receiver.packets_received(), 1);
    }

    #[test]
    fn test_resync_on_repeated_header_bytes() {
        // 4D 4D 4D 4C ...: the receiver keeps waiting for the second sync
        // byte through repeated first sync bytes
        let payload = feedback_payload(0, 140);
        let mut bytes = vec![PACKET_HEADER1, PACKET_HEADER1];
        bytes.extend_from_slice(&encode_packet(&SerialPacket::new(0x01, payload.clone())));

        let mut receiver = PacketReceiver::new();
        let received = feed(&mut receiver, &bytes);

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].address, 0x01);
        assert_eq!(received[0].data, payload);
        assert_eq!(receiver.packets_received(), 1);
    }

    #[test]
    fn test_checksum_failure_drops_frame() {
        let packet = SerialPacket::new(0x12, vec![10, 20, 30, 40]);
        let mut bytes = encode_packet(&packet);
        bytes[6] ^= 0x01; // flip one payload bit

        let mut receiver = PacketReceiver::new();
        assert!(feed(&mut receiver, &bytes).is_empty());
        assert_eq!(receiver.packets_received(), 0);

        // The receiver is back in sync and accepts the clean frame
        let received = feed(&mut receiver, &encode_packet(&packet));
        assert_eq!(received, vec![packet]);
        assert_eq!(receiver.packets_received(), 1);
    }

    #[test]
    fn test_resync_after_garbage() {
        let packet = SerialPacket::new(0x30, vec![7, 7, 7]);
        let mut bytes = vec![0x00, 0x11, 0x22, PACKET_HEADER1, 0x99, 0x42];
        bytes.extend_from_slice(&encode_packet(&packet));

        let mut receiver = PacketReceiver::new();
        let received = feed(&mut receiver, &bytes);
        assert_eq!(received, vec![packet]);
    }

    #[test]
    fn test_partial_frames_carry_across_calls() {
        let packet = SerialPacket::new(0x05, vec![1, 2, 3, 4, 5, 6]);
        let bytes = encode_packet(&packet);
        let (first, second) = bytes.split_at(5);

        let mut receiver = PacketReceiver::new();
        assert!(feed(&mut receiver, first).is_empty());
        let received = feed(&mut receiver, second);
        assert_eq!(received, vec![packet]);
    }

    #[test]
    fn test_mock_transport_carries_frames() {
        use crate::transport::Transport;

        let mock = MockTransport::new();
        let packet = SerialPacket::new(0x21, vec![0xAB; 8]);
        mock.inject_read(&encode_packet(&packet));

        let mut receiver = PacketReceiver::new();
        let mut received = Vec::new();
        let mut byte = [0u8; 1];
        let mut reader = mock.clone();
        while reader.read(&mut byte).unwrap_or(0) > 0 {
            if let Some(packet) = receiver.push_byte(byte[0]) {
                received.push(packet);
            }
        }
        assert_eq!(received, vec![packet]);
    }
}
