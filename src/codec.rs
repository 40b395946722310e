use crate::{
    config::Config,
    error::YamuxError,
    frame::Frame,
    header::{Header, HEADER_SIZE},
};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec over the transport byte stream.
///
/// The `BytesMut` the decoder is fed doubles as the per-session inbound
/// accumulator: a partial header or payload leaves the buffer untouched and
/// yields `Ok(None)` until the rest arrives.
#[derive(Debug, Clone)]
pub struct Codec {
    max_payload: usize,
}

impl Codec {
    pub fn new(config: &Config) -> Self {
        Self {
            // A well-behaved peer never sends a body past the advertised
            // window, so the window size bounds what we accept per frame.
            max_payload: config.max_stream_window_size as usize,
        }
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = YamuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Decode without consuming; the payload may not be complete yet.
        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf.copy_from_slice(&src[..HEADER_SIZE]);
        let header = Header::decode(&header_buf)?;

        let body_len = header.length as usize;
        if body_len > self.max_payload {
            return Err(YamuxError::FrameTooLarge {
                size: HEADER_SIZE + body_len,
                max: HEADER_SIZE + self.max_payload,
            });
        }

        let total = HEADER_SIZE + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(body_len).freeze();
        Ok(Some(Frame::new(header, body)))
    }
}

impl Encoder<Frame> for Codec {
    type Error = YamuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.header.length as usize != frame.body.len() {
            return Err(YamuxError::ProtocolViolation(format!(
                "frame length {} does not match body of {} bytes",
                frame.header.length,
                frame.body.len()
            )));
        }

        dst.reserve(frame.total_size());
        dst.put_slice(&frame.header.encode());
        dst.put_slice(&frame.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{Flags, FrameType, GoAwayCode};
    use bytes::Bytes;

    fn test_codec() -> Codec {
        Codec::new(&Config::default())
    }

    #[test]
    fn test_codec_round_trip_data() {
        let mut codec = test_codec();
        let frame = Frame::data(1, Bytes::from_static(b"hello world"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_round_trip_control_frames() {
        let mut codec = test_codec();
        let frames = [
            Frame::open_stream(1, 262_144),
            Frame::accept_stream(1, 262_144),
            Frame::window_update(3, 512),
            Frame::fin(5),
            Frame::rst(7),
            Frame::fin_ack(5),
            Frame::ping(42),
            Frame::ping_ack(42),
            Frame::go_away(GoAwayCode::Normal),
        ];

        for frame in frames {
            let mut buf = BytesMut::new();
            codec.encode(frame.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_decode_partial_header() {
        let mut codec = test_codec();
        let frame = Frame::open_stream(1, 1024);

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..7]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        // Nothing consumed while waiting for the rest.
        assert_eq!(partial.len(), 7);
    }

    #[test]
    fn test_decode_partial_body() {
        let mut codec = test_codec();
        let frame = Frame::data(1, Bytes::from_static(b"hello world"));

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let mut partial = BytesMut::from(&buf[..HEADER_SIZE + 5]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Feed the remainder and the frame completes.
        partial.extend_from_slice(&buf[HEADER_SIZE + 5..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = test_codec();
        let frame1 = Frame::open_stream(1, 1024);
        let frame2 = Frame::data(1, Bytes::from_static(b"abc"));
        let frame3 = Frame::fin(1);

        let mut buf = BytesMut::new();
        codec.encode(frame1.clone(), &mut buf).unwrap();
        codec.encode(frame2.clone(), &mut buf).unwrap();
        codec.encode(frame3.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame2);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), frame3);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_oversized_frame() {
        let config = crate::ConfigBuilder::new()
            .max_stream_window_size(1024)
            .max_data_frame_size(512)
            .build()
            .unwrap();
        let mut codec = Codec::new(&config);

        let mut buf = BytesMut::new();
        buf.put_slice(&Header::new(FrameType::Data, Flags::NONE, 1, 2048).encode());
        buf.put_slice(&[0u8; 2048]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(YamuxError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_invalid_version() {
        let mut codec = test_codec();
        let mut bytes = Header::new(FrameType::Ping, Flags::SYN, 0, 0).encode();
        bytes[0] = 1;

        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(YamuxError::InvalidVersion(1))
        ));
    }

    #[test]
    fn test_decode_invalid_type() {
        let mut codec = test_codec();
        let mut bytes = Header::new(FrameType::Ping, Flags::SYN, 0, 0).encode();
        bytes[1] = 9;

        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(YamuxError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_encode_rejects_length_mismatch() {
        let mut codec = test_codec();
        let frame = Frame::new(
            Header::new(FrameType::Data, Flags::NONE, 1, 10),
            Bytes::from_static(b"abc"),
        );

        let mut buf = BytesMut::new();
        assert!(codec.encode(frame, &mut buf).is_err());
    }
}
