//! DDC/CI frame encoding and decoding.
//!
//! A request frame is `[dest, source, 0x80 | len, command, payload.., checksum]`
//! where the checksum is the XOR of every preceding byte. The destination
//! byte is the I2C address of the display and is not part of the bytes
//! written to the bus. Replies are read starting at the source byte, and
//! their checksum is seeded with [`REPLY_CHECKSUM_SEED`] in place of the
//! destination.

use std::iter;
use crate::ErrorCode;

/// Destination byte of a host request (the display's write address).
pub const DDC_DEST_ADDRESS: u8 = (crate::I2C_ADDRESS_DDC_CI as u8) << 1;

/// Checksum seed used by replies from the display.
pub const REPLY_CHECKSUM_SEED: u8 = 0x50;

/// Largest data block carried by a single frame.
pub const MAX_DATA_LEN: usize = 36;

/// The DDC/CI null message, including the destination echo byte.
pub const NULL_RESPONSE: [u8; 4] = [0x6f, 0x6e, 0x80, 0xbe];

/// Direction of a frame on the bus.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Request written by the host.
    HostToDisplay,
    /// Reply read from the display.
    DisplayToHost,
}

impl Direction {
    /// Byte substituted for the destination when computing the checksum.
    pub fn checksum_seed(self) -> u8 {
        match self {
            Direction::HostToDisplay => DDC_DEST_ADDRESS,
            Direction::DisplayToHost => REPLY_CHECKSUM_SEED,
        }
    }
}

/// XOR checksum over a byte sequence.
pub fn checksum<I: IntoIterator<Item = u8>>(iter: I) -> u8 {
    iter.into_iter().fold(0u8, |sum, v| sum ^ v)
}

/// Builds a complete request frame, including the destination byte.
///
/// The command byte and payload together must not exceed
/// [`MAX_DATA_LEN`] bytes.
pub fn build_request(dest: u8, source: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() < MAX_DATA_LEN);

    let len = 1 + payload.len();
    let mut packet = Vec::with_capacity(len + 4);
    packet.push(dest);
    packet.push(source);
    packet.push(0x80 | len as u8);
    packet.push(command);
    packet.extend_from_slice(payload);
    let sum = checksum(
        iter::once(Direction::HostToDisplay.checksum_seed())
        .chain(packet[1..].iter().cloned())
    );
    packet.push(sum);

    packet
}

/// Builds a reply frame as the host reads it back from the bus, starting
/// with the source byte.
///
/// This is the display side of the protocol and is mostly useful for
/// simulated transports.
pub fn encode_reply(source: u8, opcode: u8, data: &[u8]) -> Vec<u8> {
    debug_assert!(data.len() < MAX_DATA_LEN);

    let len = 1 + data.len();
    let mut packet = Vec::with_capacity(len + 3);
    packet.push(source);
    packet.push(0x80 | len as u8);
    packet.push(opcode);
    packet.extend_from_slice(data);
    let sum = checksum(iter::once(REPLY_CHECKSUM_SEED).chain(packet.iter().cloned()));
    packet.push(sum);

    packet
}

/// Returns the null message as read from the bus.
pub fn null_reply() -> Vec<u8> {
    NULL_RESPONSE[1..].to_vec()
}

/// A reply frame that passed framing and checksum validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet<'a> {
    source: u8,
    bytes: &'a [u8],
}

impl<'a> Packet<'a> {
    /// Source address byte reported by the display.
    pub fn source(&self) -> u8 {
        self.source
    }

    /// Reply opcode.
    pub fn opcode(&self) -> u8 {
        self.bytes[0]
    }

    /// Reply bytes following the opcode.
    pub fn data(&self) -> &'a [u8] {
        &self.bytes[1..]
    }

    /// The opcode followed by the reply data, without framing.
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

fn is_null_message(raw: &[u8]) -> bool {
    raw.len() >= 3 && raw[..3] == NULL_RESPONSE[1..]
}

/// Validates a raw reply read from the bus.
///
/// `expected_opcode` is compared with the first data byte; `None` skips
/// the comparison. Sentinels are reported as [`ErrorCode::AllZero`] and
/// [`ErrorCode::NullResponse`] rather than as framing errors so callers
/// can decide what they mean for a given display.
pub fn parse_reply(raw: &[u8], expected_opcode: Option<u8>) -> Result<Packet, ErrorCode> {
    parse_frame(raw, Direction::DisplayToHost, expected_opcode)
}

/// Validates a frame as it appears on the bus, starting at the source byte.
///
/// The checksum is seeded for `direction`, so requests written by
/// [`build_request`] (minus their destination byte) parse as well as
/// replies do.
pub fn parse_frame(raw: &[u8], direction: Direction, expected_opcode: Option<u8>) -> Result<Packet, ErrorCode> {
    if raw.len() > 1 && raw[1..].iter().all(|&b| b == 0) {
        return Err(ErrorCode::AllZero)
    }

    if raw.len() < 3 {
        return Err(ErrorCode::InvalidLength)
    }

    if raw[1] & 0x80 == 0 {
        return Err(ErrorCode::InvalidLength)
    }

    let len = (raw[1] & 0x7f) as usize;
    if len > MAX_DATA_LEN || raw.len() < len + 3 {
        return Err(ErrorCode::InvalidLength)
    }

    let sum = checksum(
        iter::once(direction.checksum_seed())
        .chain(raw[..2 + len].iter().cloned())
    );
    if raw[2 + len] != sum {
        return Err(ErrorCode::InvalidChecksum)
    }

    if len == 0 {
        return if is_null_message(raw) {
            Err(ErrorCode::NullResponse)
        } else {
            Err(ErrorCode::InvalidLength)
        }
    }

    let opcode = raw[2];
    if let Some(expected) = expected_opcode {
        if opcode != expected {
            return Err(ErrorCode::InvalidOpcode)
        }
    }

    Ok(Packet {
        source: raw[0],
        bytes: &raw[2..2 + len],
    })
}
