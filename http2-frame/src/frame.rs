use std::convert::TryFrom;

use http_message::HttpError;
use netbuf::{Buf, Parser};

/// HTTP/2 frame types, RFC 7540 §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    RstStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    Goaway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "DATA",
            FrameType::Headers => "HEADERS",
            FrameType::Priority => "PRIORITY",
            FrameType::RstStream => "RST_STREAM",
            FrameType::Settings => "SETTINGS",
            FrameType::PushPromise => "PUSH_PROMISE",
            FrameType::Ping => "PING",
            FrameType::Goaway => "GOAWAY",
            FrameType::WindowUpdate => "WINDOW_UPDATE",
            FrameType::Continuation => "CONTINUATION",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = HttpError;

    fn try_from(v: u8) -> Result<FrameType, HttpError> {
        match v {
            0x0 => Ok(FrameType::Data),
            0x1 => Ok(FrameType::Headers),
            0x2 => Ok(FrameType::Priority),
            0x3 => Ok(FrameType::RstStream),
            0x4 => Ok(FrameType::Settings),
            0x5 => Ok(FrameType::PushPromise),
            0x6 => Ok(FrameType::Ping),
            0x7 => Ok(FrameType::Goaway),
            0x8 => Ok(FrameType::WindowUpdate),
            0x9 => Ok(FrameType::Continuation),
            _ => Err(HttpError::InvalidFrameType),
        }
    }
}

/// SETTINGS identifiers: the six from RFC 7540 §6.5.2 plus
/// ENABLE_CONNECT_PROTOCOL (RFC 8441) and NO_RFC7540_PRIORITIES
/// (RFC 9218).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
    EnableConnectProtocol = 0x8,
    NoRfc7540Priorities = 0x9,
}

impl TryFrom<u16> for SettingType {
    type Error = HttpError;

    fn try_from(v: u16) -> Result<SettingType, HttpError> {
        match v {
            0x1 => Ok(SettingType::HeaderTableSize),
            0x2 => Ok(SettingType::EnablePush),
            0x3 => Ok(SettingType::MaxConcurrentStreams),
            0x4 => Ok(SettingType::InitialWindowSize),
            0x5 => Ok(SettingType::MaxFrameSize),
            0x6 => Ok(SettingType::MaxHeaderListSize),
            0x8 => Ok(SettingType::EnableConnectProtocol),
            0x9 => Ok(SettingType::NoRfc7540Priorities),
            _ => Err(HttpError::InvalidSettingType),
        }
    }
}

/// 31-bit stream id plus the reserved top bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamId {
    pub r_set: bool,
    pub id: u32,
}

impl StreamId {
    pub fn new(id: u32) -> StreamId {
        StreamId {
            r_set: false,
            id: id & 0x7fff_ffff,
        }
    }

    pub(crate) fn decode(parser: &mut Parser<'_>) -> Option<StreamId> {
        let b = parser.read_bytes(4)?;
        Some(StreamId {
            r_set: b[0] & 0x80 != 0,
            id: u32::from_be_bytes([b[0] & 0x7f, b[1], b[2], b[3]]),
        })
    }

    pub(crate) fn encode(&self, buf: &mut Buf) {
        let mut bytes = self.id.to_be_bytes();
        bytes[0] = (bytes[0] & 0x7f) | if self.r_set { 0x80 } else { 0 };
        buf.add_bytes(&bytes);
    }
}

/// The 9-byte frame header: 24-bit length, type, flags, stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHdr {
    /// Payload length; only the low 24 bits are representable.
    pub length: u32,
    pub ty: FrameType,
    pub flags: u8,
    pub stream: StreamId,
}

impl FrameHdr {
    pub const SIZE: usize = 9;

    pub fn new(length: u32, ty: FrameType, flags: u8, stream: StreamId) -> FrameHdr {
        FrameHdr {
            length: length & 0x00ff_ffff,
            ty,
            flags,
            stream,
        }
    }

    /// Serialize as 9 big-endian bytes.
    pub fn encode(&self, buf: &mut Buf) {
        let len = self.length.to_be_bytes();
        buf.add_bytes(&[len[1], len[2], len[3], self.ty as u8, self.flags]);
        self.stream.encode(buf);
    }

    /// Decode a frame header. `Ok(None)` when fewer than 9 bytes are
    /// available (nothing consumed); `InvalidFrameType` consumes the
    /// header it rejected.
    pub fn decode(parser: &mut Parser<'_>) -> Result<Option<FrameHdr>, HttpError> {
        if parser.len() < FrameHdr::SIZE {
            return Ok(None);
        }
        let b = parser.read_bytes(5).expect("length checked");
        let length = u32::from_be_bytes([0, b[0], b[1], b[2]]);
        let ty_raw = b[3];
        let flags = b[4];
        let stream = StreamId::decode(parser).expect("length checked");
        let ty = FrameType::try_from(ty_raw)?;
        Ok(Some(FrameHdr {
            length,
            ty,
            flags,
            stream,
        }))
    }
}
