use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::ops::BitOr;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version carried in every header
pub const PROTOCOL_VERSION: u8 = 0;

/// Frame header size (version + type + flags + stream_id + length)
pub const HEADER_SIZE: usize = 12;

/// Default flow control window size (256 KB)
pub const DEFAULT_WINDOW_SIZE: u32 = 256 * 1024;

/// Default maximum Data payload accepted from the peer (1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Stream id reserved for session-level frames (Ping, GoAway)
pub const SESSION_STREAM_ID: u32 = 0;

/// GoAway code: normal termination
pub const GO_AWAY_NORMAL: u32 = 0;

/// GoAway code: the peer violated the protocol
pub const GO_AWAY_PROTOCOL_ERROR: u32 = 1;

/// GoAway code: local failure unrelated to the peer
pub const GO_AWAY_INTERNAL_ERROR: u32 = 2;

/// Frame type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Stream payload, `length` bytes follow the header
    Data,
    /// Send window credit for a stream
    WindowUpdate,
    /// Keepalive / RTT probe
    Ping,
    /// Session termination notice
    GoAway,
}

impl FrameType {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::WindowUpdate),
            2 => Ok(FrameType::Ping),
            3 => Ok(FrameType::GoAway),
            other => Err(Error::Protocol(format!("Unknown frame type: {}", other))),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::WindowUpdate => 1,
            FrameType::Ping => 2,
            FrameType::GoAway => 3,
        }
    }
}

/// Header flag bitmask
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Open stream
    pub const SYN: Flags = Flags(0x1);
    /// Acknowledge stream open / ping reply
    pub const ACK: Flags = Flags(0x2);
    /// Half-close the sending direction
    pub const FIN: Flags = Flags(0x4);
    /// Reset stream (abort)
    pub const RST: Flags = Flags(0x8);

    pub fn from_bits(bits: u16) -> Self {
        Flags(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (Flags::SYN, "SYN"),
            (Flags::ACK, "ACK"),
            (Flags::FIN, "FIN"),
            (Flags::RST, "RST"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "Flags({:#x})", self.0)
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Fixed-size frame header
///
/// Wire format (big-endian):
/// ```text
/// [version: u8][type: u8][flags: u16][stream_id: u32][length: u32]
/// ```
///
/// `length` is the payload size for Data, the credit delta for
/// WindowUpdate, the opaque value for Ping and the error code for GoAway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: u32, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    /// Write the header to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE);
        dst.put_u8(self.version);
        dst.put_u8(self.frame_type.as_u8());
        dst.put_u16(self.flags.bits());
        dst.put_u32(self.stream_id);
        dst.put_u32(self.length);
    }

    /// Parse and validate a header from the first `HEADER_SIZE` bytes of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "Header too short: {} bytes (expected {})",
                buf.len(),
                HEADER_SIZE
            )));
        }

        let mut cursor = &buf[..HEADER_SIZE];
        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "Unsupported protocol version: {}",
                version
            )));
        }
        let frame_type = FrameType::from_u8(cursor.get_u8())?;
        let flags = Flags::from_bits(cursor.get_u16());
        let stream_id = cursor.get_u32();
        let length = cursor.get_u32();

        Ok(Self {
            version,
            frame_type,
            flags,
            stream_id,
            length,
        })
    }

    /// Number of payload bytes that follow this header on the wire
    pub fn payload_len(&self) -> usize {
        match self.frame_type {
            FrameType::Data => self.length as usize,
            _ => 0,
        }
    }
}

/// One wire-format unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,

    /// Payload, non-empty only for Data frames
    pub payload: Bytes,
}

impl Frame {
    /// Data frame; `length` follows the payload size
    pub fn data(stream_id: u32, flags: Flags, payload: Bytes) -> Self {
        let header = Header::new(FrameType::Data, flags, stream_id, payload.len() as u32);
        Self { header, payload }
    }

    /// Window credit for `stream_id`
    pub fn window_update(stream_id: u32, flags: Flags, delta: u32) -> Self {
        Self::control(Header::new(FrameType::WindowUpdate, flags, stream_id, delta))
    }

    /// Ping request (`SYN`) or reply (`ACK`) carrying `value`
    pub fn ping(flags: Flags, value: u32) -> Self {
        Self::control(Header::new(FrameType::Ping, flags, SESSION_STREAM_ID, value))
    }

    /// Session termination with `code`
    pub fn go_away(code: u32) -> Self {
        Self::control(Header::new(FrameType::GoAway, Flags::NONE, SESSION_STREAM_ID, code))
    }

    fn control(header: Header) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.header.frame_type
    }

    pub fn flags(&self) -> Flags {
        self.header.flags
    }

    pub fn stream_id(&self) -> u32 {
        self.header.stream_id
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode exactly one frame from a complete buffer
    pub fn decode(buf: &[u8], max_frame_size: u32) -> Result<Self> {
        let mut codec = FrameCodec::new(max_frame_size);
        let mut src = BytesMut::from(buf);
        let frame = codec
            .decode(&mut src)?
            .ok_or_else(|| Error::Protocol(format!("Truncated frame: {} bytes", buf.len())))?;
        if !src.is_empty() {
            return Err(Error::Protocol(format!(
                "Trailing bytes after frame: {}",
                src.len()
            )));
        }
        Ok(frame)
    }
}

/// Incremental frame codec for `FramedRead` / `FramedWrite`
///
/// Keeps the parsed header between reads so a frame whose payload is
/// split across several network reads is assembled without re-parsing.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: u32,
    pending: Option<Header>,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self {
            max_frame_size,
            pending: None,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.pending {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    src.reserve(HEADER_SIZE - src.len());
                    return Ok(None);
                }
                let header = Header::decode(&src[..HEADER_SIZE])?;
                if header.frame_type == FrameType::Data && header.length > self.max_frame_size {
                    return Err(Error::Protocol(format!(
                        "Frame too large: {} bytes (max {})",
                        header.length, self.max_frame_size
                    )));
                }
                src.advance(HEADER_SIZE);
                self.pending = Some(header);
                header
            }
        };

        let payload_len = header.payload_len();
        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        self.pending = None;
        let payload = src.split_to(payload_len).freeze();
        Ok(Some(Frame { header, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HEADER_SIZE + frame.payload.len());
        frame.header.encode(dst);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let frames = [
            Frame::data(1, Flags::SYN, Bytes::from_static(b"hello")),
            Frame::data(7, Flags::FIN, Bytes::new()),
            Frame::window_update(2, Flags::ACK, 4096),
            Frame::ping(Flags::SYN, 0xdead_beef),
            Frame::go_away(GO_AWAY_PROTOCOL_ERROR),
        ];
        for frame in frames {
            let encoded = frame.encode();
            let decoded = Frame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_header_wire_layout() {
        let frame = Frame::window_update(0x0102_0304, Flags::SYN | Flags::ACK, 0x0a0b_0c0d);
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(
            &encoded[..],
            &[0, 1, 0, 3, 1, 2, 3, 4, 0x0a, 0x0b, 0x0c, 0x0d]
        );
    }

    #[test]
    fn test_empty_data_frame_carries_flags() {
        let frame = Frame::data(3, Flags::FIN, Bytes::new());
        let encoded = frame.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);

        let decoded = Frame::decode(&encoded, DEFAULT_MAX_FRAME_SIZE).unwrap();
        assert!(decoded.flags().contains(Flags::FIN));
        assert!(!decoded.flags().contains(Flags::RST));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_unsupported_version() {
        let mut buf = BytesMut::from(&Frame::ping(Flags::SYN, 1).encode()[..]);
        buf[0] = 1;
        assert!(matches!(
            Frame::decode(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut buf = BytesMut::from(&Frame::ping(Flags::SYN, 1).encode()[..]);
        buf[1] = 4;
        assert!(matches!(
            Frame::decode(&buf, DEFAULT_MAX_FRAME_SIZE),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_decode_frame_too_large() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        Header::new(FrameType::Data, Flags::NONE, 1, 17).encode(&mut buf);
        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_large_window_update_is_not_a_payload() {
        // length is a credit delta here, not a byte count
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&Frame::window_update(1, Flags::NONE, u32::MAX).encode()[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.length, u32::MAX);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_incremental_assembly() {
        let first = Frame::data(5, Flags::NONE, Bytes::from_static(b"split payload"));
        let second = Frame::go_away(GO_AWAY_NORMAL);
        let mut wire = BytesMut::new();
        wire.put_slice(&first.encode());
        wire.put_slice(&second.encode());

        let mut codec = FrameCodec::default();
        let mut src = BytesMut::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            src.put_u8(*byte);
            while let Some(frame) = codec.decode(&mut src).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = Frame::data(1, Flags::NONE, Bytes::from_static(b"abc")).encode();
        assert!(matches!(
            Frame::decode(&encoded[..encoded.len() - 1], DEFAULT_MAX_FRAME_SIZE),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_flags_debug() {
        assert_eq!(format!("{:?}", Flags::SYN | Flags::FIN), "SYN|FIN");
        assert_eq!(format!("{:?}", Flags::NONE), "Flags(0x0)");
    }
}
