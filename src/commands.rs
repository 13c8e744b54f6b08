//! DDC/CI command encoders and reply decoders.
//!
//! A [`Command`] knows its opcode and payload, the reply it expects and the
//! delay the display is owed afterwards. Framing, checksums and retries are
//! handled by the exchange layer.

#![allow(missing_docs)]
use std::fmt;
use std::ops::RangeInclusive;
use crate::sleep::SleepEvent;
use crate::ErrorCode;

pub use mccs::FeatureCode;

/// The value of a continuous or non-continuous VCP feature.
pub type VcpValue = mccs::Value;

pub mod opcode {
    pub const GET_VCP: u8 = 0x01;
    pub const GET_VCP_REPLY: u8 = 0x02;
    pub const SET_VCP: u8 = 0x03;
    pub const TIMING_REQUEST: u8 = 0x07;
    pub const SAVE_SETTINGS: u8 = 0x0c;
    pub const TIMING_REPLY: u8 = 0x4e;
    pub const TABLE_READ: u8 = 0xe2;
    pub const CAPABILITIES_REPLY: u8 = 0xe3;
    pub const TABLE_READ_REPLY: u8 = 0xe4;
    pub const TABLE_WRITE: u8 = 0xe7;
    pub const CAPABILITIES: u8 = 0xf3;
}

/// Largest table fragment carried by one Table Write.
pub const TABLE_FRAGMENT_LEN: usize = 32;

pub trait Command {
    type Ok: CommandResult;
    /// First byte of the request body.
    const OPCODE: u8;
    /// Opcode the reply must carry, `None` for write-only commands.
    const REPLY_OPCODE: Option<u8>;
    /// Delay owed to the display once the command completes.
    const POST_EXCHANGE: SleepEvent;
    /// Whether a null response always means the feature is unsupported.
    const NULL_MEANS_UNSUPPORTED: bool = false;

    /// Appends the bytes following the opcode.
    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode>;

    /// Decodes the reply bytes (opcode first) into the command result.
    fn decode(&self, data: &[u8]) -> Result<Self::Ok, ErrorCode> {
        Self::Ok::decode(data)
    }
}

pub trait CommandResult: Sized {
    /// Longest reply body, opcode included.
    const MAX_LEN: usize;
    fn decode(data: &[u8]) -> Result<Self, ErrorCode>;
}

/// Checks the opcode and length of a reply and strips the opcode.
fn reply_body(data: &[u8], opcode: u8, len: RangeInclusive<usize>) -> Result<&[u8], ErrorCode> {
    match data.split_first() {
        _ if !len.contains(&data.len()) => Err(ErrorCode::InvalidLength),
        Some((&op, body)) if op == opcode => Ok(body),
        _ => Err(ErrorCode::InvalidOpcode),
    }
}

fn be16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

#[derive(Copy, Clone, Debug)]
pub struct GetVcpFeature {
    pub code: FeatureCode,
}

impl GetVcpFeature {
    pub fn new(code: FeatureCode) -> Self {
        GetVcpFeature {
            code: code,
        }
    }
}

impl Command for GetVcpFeature {
    type Ok = VcpValue;
    const OPCODE: u8 = opcode::GET_VCP;
    const REPLY_OPCODE: Option<u8> = Some(opcode::GET_VCP_REPLY);
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostRead;

    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        out.push(self.code);
        Ok(())
    }

    fn decode(&self, data: &[u8]) -> Result<VcpValue, ErrorCode> {
        let value = VcpValue::decode(data)?;
        if data[2] != self.code {
            return Err(ErrorCode::InvalidData)
        }

        // some displays answer unsupported features with nothing but zeroes
        if value.maximum() == 0 && value.value() == 0 {
            return Err(ErrorCode::AllZero)
        }

        Ok(value)
    }
}

impl CommandResult for VcpValue {
    const MAX_LEN: usize = 8;

    fn decode(data: &[u8]) -> Result<Self, ErrorCode> {
        let body = reply_body(data, opcode::GET_VCP_REPLY, 8..=8)?;
        let (result, rest) = body.split_at(1);
        match result[0] {
            0x00 => (),
            0x01 => return Err(ErrorCode::ReportedUnsupported),
            rc => return Err(ErrorCode::Invalid(format!("VCP reply carries result code {:#04x}", rc))),
        }

        // rest[0] echoes the requested feature
        Ok(VcpValue {
            ty: rest[1],
            mh: rest[2],
            ml: rest[3],
            sh: rest[4],
            sl: rest[5],
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SetVcpFeature {
    pub code: FeatureCode,
    pub value: u16,
}

impl SetVcpFeature {
    pub fn new(code: FeatureCode, value: u16) -> Self {
        SetVcpFeature {
            code: code,
            value: value,
        }
    }
}

impl Command for SetVcpFeature {
    type Ok = ();
    const OPCODE: u8 = opcode::SET_VCP;
    const REPLY_OPCODE: Option<u8> = None;
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostWrite;

    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        out.push(self.code);
        out.extend_from_slice(&self.value.to_be_bytes());
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SaveCurrentSettings;

impl Command for SaveCurrentSettings {
    type Ok = ();
    const OPCODE: u8 = opcode::SAVE_SETTINGS;
    const REPLY_OPCODE: Option<u8> = None;
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostSaveSettings;

    fn payload(&self, _out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        Ok(())
    }
}

/// One fragment of a multi-part table write.
#[derive(Copy, Clone, Debug)]
pub struct TableWrite<'a> {
    pub code: FeatureCode,
    pub offset: u16,
    pub data: &'a [u8],
}

impl<'a> TableWrite<'a> {
    pub fn new(code: FeatureCode, offset: u16, data: &'a [u8]) -> Self {
        TableWrite {
            code: code,
            offset: offset,
            data: data,
        }
    }
}

impl<'a> Command for TableWrite<'a> {
    type Ok = ();
    const OPCODE: u8 = opcode::TABLE_WRITE;
    const REPLY_OPCODE: Option<u8> = None;
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostWrite;

    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        if self.data.len() > TABLE_FRAGMENT_LEN {
            return Err(ErrorCode::InvalidLength)
        }

        out.push(self.code);
        out.extend_from_slice(&self.offset.to_be_bytes());
        out.extend_from_slice(self.data);
        Ok(())
    }
}

/// One fragment of a multi-part table read.
#[derive(Copy, Clone, Debug)]
pub struct TableRead {
    pub code: FeatureCode,
    pub offset: u16,
}

impl TableRead {
    pub fn new(code: FeatureCode, offset: u16) -> Self {
        TableRead {
            code: code,
            offset: offset,
        }
    }
}

impl Command for TableRead {
    type Ok = TableResponse;
    const OPCODE: u8 = opcode::TABLE_READ;
    const REPLY_OPCODE: Option<u8> = Some(opcode::TABLE_READ_REPLY);
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostRead;
    const NULL_MEANS_UNSUPPORTED: bool = true;

    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        out.push(self.code);
        out.extend_from_slice(&self.offset.to_be_bytes());
        Ok(())
    }
}

/// One fragment of the capabilities string.
#[derive(Copy, Clone, Debug)]
pub struct CapabilitiesRequest {
    pub offset: u16,
}

impl CapabilitiesRequest {
    pub fn new(offset: u16) -> Self {
        CapabilitiesRequest {
            offset: offset,
        }
    }
}

impl Command for CapabilitiesRequest {
    type Ok = CapabilitiesReply;
    const OPCODE: u8 = opcode::CAPABILITIES;
    const REPLY_OPCODE: Option<u8> = Some(opcode::CAPABILITIES_REPLY);
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostRead;

    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        out.extend_from_slice(&self.offset.to_be_bytes());
        Ok(())
    }
}

/// A fragment of table data and the offset it starts at.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TableResponse {
    pub offset: u16,
    data: Vec<u8>,
}

impl TableResponse {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for TableResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TableResponse@{} {:02x?}", self.offset, self.data)
    }
}

impl CommandResult for TableResponse {
    const MAX_LEN: usize = 3 + TABLE_FRAGMENT_LEN;

    fn decode(data: &[u8]) -> Result<Self, ErrorCode> {
        let body = reply_body(data, opcode::TABLE_READ_REPLY, 3..=Self::MAX_LEN)?;
        Ok(TableResponse {
            offset: be16(body[0], body[1]),
            data: body[2..].to_vec(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct CapabilitiesReply {
    pub offset: u16,
    pub data: Box<[u8]>,
}

impl CommandResult for CapabilitiesReply {
    const MAX_LEN: usize = 3 + TABLE_FRAGMENT_LEN;

    fn decode(data: &[u8]) -> Result<Self, ErrorCode> {
        let body = reply_body(data, opcode::CAPABILITIES_REPLY, 3..=Self::MAX_LEN)?;
        Ok(CapabilitiesReply {
            offset: be16(body[0], body[1]),
            data: body[2..].into(),
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct GetTimingReport;

impl Command for GetTimingReport {
    type Ok = TimingMessage;
    const OPCODE: u8 = opcode::TIMING_REQUEST;
    const REPLY_OPCODE: Option<u8> = Some(opcode::TIMING_REPLY);
    const POST_EXCHANGE: SleepEvent = SleepEvent::PostRead;

    fn payload(&self, _out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimingMessage {
    pub timing_status: u8,
    pub horizontal_frequency: u16,
    pub vertical_frequency: u16,
}

impl CommandResult for TimingMessage {
    const MAX_LEN: usize = 6;

    fn decode(data: &[u8]) -> Result<Self, ErrorCode> {
        let body = reply_body(data, opcode::TIMING_REPLY, 6..=6)?;
        Ok(TimingMessage {
            timing_status: body[0],
            horizontal_frequency: be16(body[1], body[2]),
            vertical_frequency: be16(body[3], body[4]),
        })
    }
}

impl CommandResult for () {
    const MAX_LEN: usize = 0;

    fn decode(_data: &[u8]) -> Result<Self, ErrorCode> {
        Ok(())
    }
}

impl<'a, C: Command> Command for &'a C {
    type Ok = C::Ok;
    const OPCODE: u8 = C::OPCODE;
    const REPLY_OPCODE: Option<u8> = C::REPLY_OPCODE;
    const POST_EXCHANGE: SleepEvent = C::POST_EXCHANGE;
    const NULL_MEANS_UNSUPPORTED: bool = C::NULL_MEANS_UNSUPPORTED;

    fn payload(&self, out: &mut Vec<u8>) -> Result<(), ErrorCode> {
        (**self).payload(out)
    }

    fn decode(&self, data: &[u8]) -> Result<Self::Ok, ErrorCode> {
        (**self).decode(data)
    }
}
