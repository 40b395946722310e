use crate::error::{Result, YamuxError};

/// Wire header size: version(1) + type(1) + flags(2) + stream_id(4) + length(4).
pub const HEADER_SIZE: usize = 12;

/// The only protocol version this implementation speaks.
pub const PROTO_VERSION: u8 = 0;

/// Stream id 0 is reserved for session-level frames (PING, GO_AWAY).
pub const SESSION_STREAM_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data,
    WindowUpdate,
    Ping,
    GoAway,
}

impl FrameType {
    pub const DATA: u8 = 0x0;
    pub const WINDOW_UPDATE: u8 = 0x1;
    pub const PING: u8 = 0x2;
    pub const GO_AWAY: u8 = 0x3;

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            Self::DATA => Ok(FrameType::Data),
            Self::WINDOW_UPDATE => Ok(FrameType::WindowUpdate),
            Self::PING => Ok(FrameType::Ping),
            Self::GO_AWAY => Ok(FrameType::GoAway),
            other => Err(YamuxError::InvalidFrameType(other)),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            FrameType::Data => Self::DATA,
            FrameType::WindowUpdate => Self::WINDOW_UPDATE,
            FrameType::Ping => Self::PING,
            FrameType::GoAway => Self::GO_AWAY,
        }
    }
}

/// Frame flag bitset. Unknown bits are preserved on decode and ignored by
/// the handlers, per the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0x0);
    pub const SYN: Flags = Flags(0x1);
    pub const ACK: Flags = Flags(0x2);
    pub const FIN: Flags = Flags(0x4);
    pub const RST: Flags = Flags(0x8);

    pub fn from_bits(bits: u16) -> Flags {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// GO_AWAY reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayCode {
    Normal,
    ProtocolError,
    InternalError,
}

impl GoAwayCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(GoAwayCode::Normal),
            0x1 => Some(GoAwayCode::ProtocolError),
            0x2 => Some(GoAwayCode::InternalError),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            GoAwayCode::Normal => 0x0,
            GoAwayCode::ProtocolError => 0x1,
            GoAwayCode::InternalError => 0x2,
        }
    }
}

/// Decoded frame header. The version byte is not carried: it is always
/// [`PROTO_VERSION`] on encode and anything else fails decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ty: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(ty: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Self {
            ty,
            flags,
            stream_id,
            length,
        }
    }

    /// Encode into the 12-byte big-endian wire layout. Total.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTO_VERSION;
        buf[1] = self.ty.to_byte();
        buf[2..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode a 12-byte header. Fails on an unknown version or type; flags
    /// and length are validated per-type by the frame handlers, not here.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        if buf[0] != PROTO_VERSION {
            return Err(YamuxError::InvalidVersion(buf[0]));
        }
        let ty = FrameType::from_byte(buf[1])?;
        let flags = Flags::from_bits(u16::from_be_bytes([buf[2], buf[3]]));
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self {
            ty,
            flags,
            stream_id,
            length,
        })
    }
}
