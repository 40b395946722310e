use crate::{
    error::{Result, YamuxError},
    header::{Flags, FrameType, GoAwayCode, Header, SESSION_STREAM_ID},
};
use bytes::Bytes;

/// A single wire frame: a decoded header plus its payload body.
///
/// Constructors cover every frame shape this implementation emits; the
/// header length is always consistent with the body they attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    pub fn new(header: Header, body: Bytes) -> Self {
        Self { header, body }
    }

    /// DATA frame carrying stream bytes.
    pub fn data(stream_id: u32, body: Bytes) -> Self {
        Self {
            header: Header::new(FrameType::Data, Flags::NONE, stream_id, body.len() as u32),
            body,
        }
    }

    /// Half-close: an empty DATA frame with FIN set.
    pub fn fin(stream_id: u32) -> Self {
        Self {
            header: Header::new(FrameType::Data, Flags::FIN, stream_id, 0),
            body: Bytes::new(),
        }
    }

    /// Abortive close: an empty DATA frame with RST set.
    pub fn rst(stream_id: u32) -> Self {
        Self {
            header: Header::new(FrameType::Data, Flags::RST, stream_id, 0),
            body: Bytes::new(),
        }
    }

    /// SYN: announces a new stream and advertises the opener's initial
    /// receive window in one WINDOW_UPDATE frame.
    pub fn open_stream(stream_id: u32, window: u32) -> Self {
        Self::window_frame(Flags::SYN, stream_id, window)
    }

    /// SYN|ACK: accepts a stream, advertising our receive window back.
    pub fn accept_stream(stream_id: u32, window: u32) -> Self {
        Self::window_frame(Flags::SYN | Flags::ACK, stream_id, window)
    }

    /// Bare window replenishment of `delta` bytes.
    pub fn window_update(stream_id: u32, delta: u32) -> Self {
        Self::window_frame(Flags::NONE, stream_id, delta)
    }

    /// Legacy FIN acknowledgement: pure flag frames carry length 0.
    pub fn fin_ack(stream_id: u32) -> Self {
        Self {
            header: Header::new(FrameType::WindowUpdate, Flags::FIN | Flags::ACK, stream_id, 0),
            body: Bytes::new(),
        }
    }

    /// PING request; the opaque token rides in the stream id field.
    pub fn ping(token: u32) -> Self {
        Self {
            header: Header::new(FrameType::Ping, Flags::SYN, token, 0),
            body: Bytes::new(),
        }
    }

    /// PING reply echoing the token.
    pub fn ping_ack(token: u32) -> Self {
        Self {
            header: Header::new(FrameType::Ping, Flags::ACK, token, 0),
            body: Bytes::new(),
        }
    }

    /// Session-level GO_AWAY with a 4-byte reason payload.
    pub fn go_away(code: GoAwayCode) -> Self {
        Self {
            header: Header::new(FrameType::GoAway, Flags::NONE, SESSION_STREAM_ID, 4),
            body: Bytes::copy_from_slice(&code.to_u32().to_be_bytes()),
        }
    }

    fn window_frame(flags: Flags, stream_id: u32, value: u32) -> Self {
        Self {
            header: Header::new(FrameType::WindowUpdate, flags, stream_id, 4),
            body: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    pub fn total_size(&self) -> usize {
        crate::header::HEADER_SIZE + self.body.len()
    }

    /// The window value carried by a WINDOW_UPDATE frame.
    ///
    /// A length-0 frame is tolerated as a delta of 0: the reference
    /// implementation emits flag-only WINDOW_UPDATE frames without a
    /// payload, and peers must accept them.
    pub fn window_delta(&self) -> Result<u32> {
        match self.body.len() {
            0 => Ok(0),
            4 => Ok(u32::from_be_bytes([
                self.body[0],
                self.body[1],
                self.body[2],
                self.body[3],
            ])),
            n => Err(YamuxError::ProtocolViolation(format!(
                "WINDOW_UPDATE payload must be 0 or 4 bytes, got {n}"
            ))),
        }
    }

    /// The reason code carried by a GO_AWAY frame.
    pub fn go_away_code(&self) -> Result<u32> {
        if self.body.len() != 4 {
            return Err(YamuxError::ProtocolViolation(format!(
                "GO_AWAY payload must be 4 bytes, got {}",
                self.body.len()
            )));
        }
        Ok(u32::from_be_bytes([
            self.body[0],
            self.body[1],
            self.body[2],
            self.body[3],
        ]))
    }

    /// The opaque ping token (carried in the stream id field).
    pub fn ping_token(&self) -> u32 {
        self.header.stream_id
    }
}
