//! ABCD frame layout and CRC handling.
//!
//! ```text
//!  0    2    4    5      7    8          8+len    10+len
//! [dst][src][len][00 00][op][payload...][crc16 LE]
//! ```
//!
//! Addresses are big-endian. The checksum is CRC-16/ARC over every byte
//! before the trailer and is transmitted little-endian.

use crc::{CRC_16_ARC, Crc};
use std::fmt::{Display, Formatter};

use crate::protocol::registry::{DeviceClass, TableId};

const ARC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

pub const HEADER_LEN: usize = 8;
pub const TRAILER_LEN: usize = 2;
/// Smallest possible frame (empty payload).
pub const MIN_FRAME_LEN: usize = HEADER_LEN + TRAILER_LEN;
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Read/write requests carry three flag bytes after the table id.
const TABLE_FLAGS: [u8; 3] = [0x00, 0x00, 0x00];
/// Offset of the table bytes inside a read ACK payload.
const TABLE_DATA_OFFSET: usize = TableId::LEN + TABLE_FLAGS.len();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Ack,
    Read,
    Write,
    Nak,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(byte: u8) -> Self {
        match byte {
            0x06 => Opcode::Ack,
            0x0b => Opcode::Read,
            0x0c => Opcode::Write,
            0x15 => Opcode::Nak,
            other => Opcode::Other(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        match op {
            Opcode::Ack => 0x06,
            Opcode::Read => 0x0b,
            Opcode::Write => 0x0c,
            Opcode::Nak => 0x15,
            Opcode::Other(byte) => byte,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Trailing checksum does not match the recomputed one.
    Corrupt { received: u16, calculated: u16 },
    /// Declared frame length disagrees with the bytes actually captured.
    Truncated { declared: usize, captured: usize },
    /// Payload does not fit the one-byte length field.
    Oversized(usize),
}

impl Display for FrameError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Corrupt { received, calculated } => {
                write!(f, "frame corrupt: crc {:04x} != calculated {:04x}", received, calculated)
            }
            FrameError::Truncated { declared, captured } => {
                write!(f, "frame truncated: declared {} bytes, captured {}", declared, captured)
            }
            FrameError::Oversized(len) => write!(f, "payload of {} bytes exceeds {}", len, MAX_PAYLOAD),
        }
    }
}

impl std::error::Error for FrameError {}

pub fn checksum(bytes: &[u8]) -> u16 {
    ARC.checksum(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: u16,
    pub src: u16,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(dst: u16, src: u16, opcode: Opcode, payload: Vec<u8>) -> Self {
        Self {
            dst,
            src,
            opcode,
            payload,
        }
    }

    pub fn read_request(dst: u16, src: u16, table: TableId) -> Self {
        Self::new(dst, src, Opcode::Read, table.bytes().to_vec())
    }

    pub fn write_request(dst: u16, src: u16, table: TableId, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(TABLE_DATA_OFFSET + data.len());
        payload.extend_from_slice(&table.bytes());
        payload.extend_from_slice(&TABLE_FLAGS);
        payload.extend_from_slice(data);
        Self::new(dst, src, Opcode::Write, payload)
    }

    /// ACK for a read: table id, flags, then the table contents.
    pub fn read_response(request: &Frame, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(TABLE_DATA_OFFSET + data.len());
        payload.extend_from_slice(&request.payload[..TableId::LEN.min(request.payload.len())]);
        payload.extend_from_slice(&TABLE_FLAGS);
        payload.extend_from_slice(data);
        Self::new(request.src, request.dst, Opcode::Ack, payload)
    }

    pub fn encoded_len(&self) -> usize {
        MIN_FRAME_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::Oversized(self.payload.len()));
        }
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.dst.to_be_bytes());
        out.extend_from_slice(&self.src.to_be_bytes());
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&[0x00, 0x00]);
        out.push(self.opcode.into());
        out.extend_from_slice(&self.payload);
        let crc = checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Decode exactly one captured frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let declared = declared_len(bytes).unwrap_or(MIN_FRAME_LEN);
        if bytes.len() < MIN_FRAME_LEN || declared != bytes.len() {
            return Err(FrameError::Truncated {
                declared,
                captured: bytes.len(),
            });
        }

        let (body, trailer) = bytes.split_at(bytes.len() - TRAILER_LEN);
        let received = u16::from_le_bytes([trailer[0], trailer[1]]);
        let calculated = checksum(body);
        if received != calculated {
            return Err(FrameError::Corrupt { received, calculated });
        }

        Ok(Self {
            dst: u16::from_be_bytes([body[0], body[1]]),
            src: u16::from_be_bytes([body[2], body[3]]),
            opcode: Opcode::from(body[7]),
            payload: body[HEADER_LEN..].to_vec(),
        })
    }

    pub fn table_id(&self) -> Option<TableId> {
        TableId::from_slice(self.payload.get(..TableId::LEN)?)
    }

    /// Table bytes carried by a read ACK.
    pub fn table_data(&self) -> Option<&[u8]> {
        self.payload.get(TABLE_DATA_OFFSET..)
    }

    /// Bytes a reply to this frame starts with: its `dst|src` header.
    pub fn reply_anchor(&self) -> [u8; 4] {
        let [a, b] = self.src.to_be_bytes();
        let [c, d] = self.dst.to_be_bytes();
        [a, b, c, d]
    }

    /// Whether `self` is the device's reply to `request`.
    pub fn answers(&self, request: &Frame) -> bool {
        if self.src != request.dst || self.dst != request.src {
            return false;
        }
        match self.opcode {
            Opcode::Nak => true,
            Opcode::Ack if request.opcode == Opcode::Read => self.table_id() == request.table_id(),
            Opcode::Ack => true,
            _ => false,
        }
    }
}

/// Total frame length announced by a (possibly partial) header.
pub fn declared_len(bytes: &[u8]) -> Option<usize> {
    bytes.get(4).map(|len| *len as usize + MIN_FRAME_LEN)
}

/// Whether `bytes` start like a frame between known peers: both addresses
/// on the bus, zero reserved bytes and a known opcode.
pub fn plausible_header(bytes: &[u8]) -> bool {
    let Some(header) = bytes.get(..HEADER_LEN) else {
        return false;
    };
    let dst = u16::from_be_bytes([header[0], header[1]]);
    let src = u16::from_be_bytes([header[2], header[3]]);
    DeviceClass::from_bus_address(dst).is_some()
        && DeviceClass::from_bus_address(src).is_some()
        && header[5..7] == [0x00, 0x00]
        && !matches!(Opcode::from(header[7]), Opcode::Other(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMFORT: TableId = TableId::new(0x00, 0x40, 0x0a);

    #[test]
    fn crc_matches_arc_check_value() {
        assert_eq!(checksum(b"123456789"), 0xbb3d);
    }

    #[test]
    fn encodes_read_request_like_a_capture() {
        let frame = Frame::read_request(0x2001, 0x9201, COMFORT);
        assert_eq!(
            frame.encode().unwrap(),
            vec![
                0x20, 0x01, 0x92, 0x01, 0x03, 0x00, 0x00, 0x0b, 0x00, 0x40, 0x0a, // header + table
                0x0e, 0x4c, // crc, little-endian
            ]
        );
    }

    #[test]
    fn decodes_write_ack() {
        let bytes = [0x92, 0x01, 0x20, 0x01, 0x01, 0x00, 0x00, 0x06, 0x00, 0x6a, 0xd9];
        let frame = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, Frame::new(0x9201, 0x2001, Opcode::Ack, vec![0x00]));
    }

    #[test]
    fn round_trips_frames() {
        let frames = [
            Frame::read_request(0x5101, 0x9201, TableId::new(0x00, 0x03, 0x04)),
            Frame::write_request(0x2001, 0x9201, COMFORT, &[0x44; 64]),
            Frame::new(0x4001, 0x2001, Opcode::Other(0x10), vec![]),
        ];
        for frame in frames {
            let encoded = frame.encode().unwrap();
            assert_eq!(encoded.len(), frame.encoded_len());
            assert_eq!(Frame::decode(&encoded).unwrap(), frame);
        }
    }

    #[test]
    fn single_bit_flips_change_the_checksum() {
        let payloads: [&[u8]; 3] = [&[0x00], &[0x00, 0x40, 0x0a, 0x00, 0x00, 0x00, 0x44, 0x4c], &[0xff; 32]];
        for payload in payloads {
            let frame = Frame::new(0x2001, 0x9201, Opcode::Write, payload.to_vec());
            let encoded = frame.encode().unwrap();
            let body = &encoded[..encoded.len() - TRAILER_LEN];
            let original = checksum(body);
            for bit in 0..(payload.len() * 8) {
                let mut flipped = body.to_vec();
                flipped[HEADER_LEN + bit / 8] ^= 1 << (bit % 8);
                assert_ne!(checksum(&flipped), original, "bit {} of {:02x?}", bit, payload);
            }
        }
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut bytes = Frame::read_request(0x2001, 0x9201, COMFORT).encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(Frame::decode(&bytes), Err(FrameError::Corrupt { .. })));
    }

    #[test]
    fn rejects_length_mismatch() {
        let bytes = Frame::read_request(0x2001, 0x9201, COMFORT).encode().unwrap();
        assert_eq!(
            Frame::decode(&bytes[..bytes.len() - 1]),
            Err(FrameError::Truncated {
                declared: 13,
                captured: 12
            })
        );
        assert_eq!(
            Frame::decode(&bytes[..3]),
            Err(FrameError::Truncated {
                declared: MIN_FRAME_LEN,
                captured: 3
            })
        );
    }

    #[test]
    fn oversized_payload_is_refused() {
        let frame = Frame::new(0x2001, 0x9201, Opcode::Write, vec![0; 256]);
        assert_eq!(frame.encode(), Err(FrameError::Oversized(256)));
    }

    #[test]
    fn read_ack_must_echo_table() {
        let request = Frame::read_request(0x2001, 0x9201, COMFORT);
        let reply = Frame::read_response(&request, &[1, 2, 3]);
        assert!(reply.answers(&request));
        assert_eq!(reply.table_data(), Some(&[1u8, 2, 3][..]));

        let other = Frame::read_request(0x2001, 0x9201, TableId::new(0x00, 0x46, 0x0e));
        assert!(!reply.answers(&other));
        assert_eq!(request.reply_anchor(), [0x92, 0x01, 0x20, 0x01]);
        assert_eq!(&reply.encode().unwrap()[..4], &request.reply_anchor());
    }

    #[test]
    fn recognises_headers_between_known_peers() {
        let bytes = Frame::read_request(0x4001, 0x2001, COMFORT).encode().unwrap();
        assert!(plausible_header(&bytes[..HEADER_LEN]));
        assert!(!plausible_header(&bytes[..HEADER_LEN - 1]));

        let mut unknown_peer = bytes.clone();
        unknown_peer[0] = 0x77;
        assert!(!plausible_header(&unknown_peer));

        let mut reserved_set = bytes;
        reserved_set[5] = 0x01;
        assert!(!plausible_header(&reserved_set));
    }
}
