//! Framing: 4-byte BE signed length + 1-byte kind + payload.
//!
//! The length covers the kind byte and the payload, never itself. A
//! `StreamOpen` frame carries only the stream sub-header; the raw file bytes
//! that follow it on the socket are outside the frame and are read by the
//! caller (see `StreamHeader::size`).

use std::string::FromUtf8Error;

/// Bytes in the length prefix.
pub const LEN_SIZE: usize = 4;
/// Bytes in the length prefix plus the kind tag.
pub const HEADER_SIZE: usize = LEN_SIZE + 1;
/// Upper bound for a control or chunk frame. Chunks are 256 KiB, so this is generous.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Frame kind tag (second field on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// UTF-8 JSON control envelope.
    Control = 0,
    /// Opaque chunk payload (see `chunk::decode_chunk`).
    Chunk = 1,
    /// Raw stream sub-header; `size` raw bytes follow outside the frame.
    StreamOpen = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameDecodeError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(FrameKind::Control),
            1 => Ok(FrameKind::Chunk),
            2 => Ok(FrameKind::StreamOpen),
            other => Err(FrameDecodeError::UnknownKind(other)),
        }
    }
}

/// Stream sub-header: `nameLen:int32, name, fileSize:int64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub name: String,
    pub size: u64,
}

impl StreamHeader {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    fn encoded_len(&self) -> usize {
        4 + self.name.len() + 8
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameEncodeError> {
        let name_len = i32::try_from(self.name.len()).map_err(|_| FrameEncodeError::NameTooLong)?;
        let size = i64::try_from(self.size).map_err(|_| FrameEncodeError::TooLarge)?;
        out.extend_from_slice(&name_len.to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&size.to_be_bytes());
        Ok(())
    }

    /// Parse a stream sub-header. The body must hold exactly one header.
    pub fn decode(body: &[u8]) -> Result<Self, FrameDecodeError> {
        if body.len() < 4 {
            return Err(FrameDecodeError::Malformed("stream header too short"));
        }
        let name_len = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let name_len =
            usize::try_from(name_len).map_err(|_| FrameDecodeError::Malformed("negative name length"))?;
        if body.len() != 4 + name_len + 8 {
            return Err(FrameDecodeError::Malformed("stream header length mismatch"));
        }
        let name = String::from_utf8(body[4..4 + name_len].to_vec())?;
        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&body[4 + name_len..]);
        let size = i64::from_be_bytes(size_bytes);
        let size = u64::try_from(size).map_err(|_| FrameDecodeError::Malformed("negative file size"))?;
        Ok(Self { name, size })
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(String),
    Chunk(Vec<u8>),
    StreamOpen(StreamHeader),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Control(_) => FrameKind::Control,
            Frame::Chunk(_) => FrameKind::Chunk,
            Frame::StreamOpen(_) => FrameKind::StreamOpen,
        }
    }
}

/// Parsed length + kind prefix of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    /// Payload bytes after the kind tag (`length - 1`).
    pub body_len: usize,
}

/// Encode a frame: 4 bytes BE length, kind tag, payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let body_len = match frame {
        Frame::Control(text) => text.len(),
        Frame::Chunk(bytes) => bytes.len(),
        Frame::StreamOpen(header) => header.encoded_len(),
    };
    let len = body_len + 1;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + len);
    out.extend_from_slice(&(len as i32).to_be_bytes());
    out.push(frame.kind() as u8);
    match frame {
        Frame::Control(text) => out.extend_from_slice(text.as_bytes()),
        Frame::Chunk(bytes) => out.extend_from_slice(bytes),
        Frame::StreamOpen(header) => header.encode_into(&mut out)?,
    }
    Ok(out)
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
    #[error("file name too long")]
    NameTooLong,
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Parse the 5-byte length + kind prefix. Lengths <= 0 are fatal for the connection.
pub fn decode_header(bytes: &[u8; HEADER_SIZE]) -> Result<FrameHeader, FrameDecodeError> {
    let len = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len <= 0 {
        return Err(FrameDecodeError::InvalidLength(len));
    }
    if len as u32 > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let kind = FrameKind::try_from(bytes[4])?;
    Ok(FrameHeader {
        kind,
        body_len: len as usize - 1,
    })
}

/// Turn a complete frame body into a `Frame`.
pub fn decode_body(kind: FrameKind, body: Vec<u8>) -> Result<Frame, FrameDecodeError> {
    match kind {
        FrameKind::Control => Ok(Frame::Control(String::from_utf8(body)?)),
        FrameKind::Chunk => Ok(Frame::Chunk(body)),
        FrameKind::StreamOpen => Ok(Frame::StreamOpen(StreamHeader::decode(&body)?)),
    }
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
/// For `StreamOpen`, the consumed count stops at the sub-header; raw bytes follow.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut prefix = [0u8; HEADER_SIZE];
    prefix.copy_from_slice(&bytes[..HEADER_SIZE]);
    let header = decode_header(&prefix)?;
    let end = HEADER_SIZE + header.body_len;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame = decode_body(header.kind, bytes[HEADER_SIZE..end].to_vec())?;
    Ok((frame, end))
}

/// Error decoding a frame. Everything except `NeedMore` is a protocol violation.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("invalid frame length {0}")]
    InvalidLength(i32),
    #[error("frame too large")]
    TooLarge,
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("control payload is not UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_control() {
        let frame = Frame::Control(r#"{"type":"text","content":"hi"}"#.to_string());
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(&bytes[..4], &(bytes.len() as i32 - 4).to_be_bytes());
        assert_eq!(bytes[4], 0);
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_large_chunk() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let frame = Frame::Chunk(payload.clone());
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, Frame::Chunk(payload));
    }

    #[test]
    fn stream_open_header_layout() {
        let frame = Frame::StreamOpen(StreamHeader::new("a.bin", 10));
        let bytes = encode_frame(&frame).unwrap();
        // length = kind + nameLen + name + size
        assert_eq!(&bytes[..4], &(1 + 4 + 5 + 8i32).to_be_bytes());
        assert_eq!(bytes[4], 2);
        assert_eq!(&bytes[5..9], &5i32.to_be_bytes());
        assert_eq!(&bytes[9..14], b"a.bin");
        assert_eq!(&bytes[14..22], &10i64.to_be_bytes());
        let (decoded, _) = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&Frame::Control("hello".into())).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..HEADER_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = encode_frame(&Frame::Control("one".into())).unwrap();
        let b = encode_frame(&Frame::Chunk(vec![1, 2, 3])).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
        let (f1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, a.len());
        let (f2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, b.len());
        assert_eq!(f1, Frame::Control("one".into()));
        assert_eq!(f2, Frame::Chunk(vec![1, 2, 3]));
    }

    #[test]
    fn non_positive_length_is_fatal() {
        let zero = [0, 0, 0, 0, 0];
        assert!(matches!(
            decode_header(&zero),
            Err(FrameDecodeError::InvalidLength(0))
        ));
        let mut negative = [0u8; HEADER_SIZE];
        negative[..4].copy_from_slice(&(-7i32).to_be_bytes());
        assert!(matches!(
            decode_header(&negative),
            Err(FrameDecodeError::InvalidLength(-7))
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let mut prefix = [0u8; HEADER_SIZE];
        prefix[..4].copy_from_slice(&1i32.to_be_bytes());
        prefix[4] = 9;
        assert!(matches!(
            decode_header(&prefix),
            Err(FrameDecodeError::UnknownKind(9))
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut prefix = [0u8; HEADER_SIZE];
        prefix[..4].copy_from_slice(&((MAX_FRAME_LEN + 1) as i32).to_be_bytes());
        assert!(matches!(
            decode_header(&prefix),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn stream_header_rejects_inconsistent_lengths() {
        let mut body = Vec::new();
        body.extend_from_slice(&50i32.to_be_bytes());
        body.extend_from_slice(b"short");
        body.extend_from_slice(&1i64.to_be_bytes());
        assert!(matches!(
            StreamHeader::decode(&body),
            Err(FrameDecodeError::Malformed(_))
        ));

        let mut negative = Vec::new();
        negative.extend_from_slice(&1i32.to_be_bytes());
        negative.push(b'x');
        negative.extend_from_slice(&(-1i64).to_be_bytes());
        assert!(matches!(
            StreamHeader::decode(&negative),
            Err(FrameDecodeError::Malformed(_))
        ));
    }

    #[test]
    fn invalid_utf8_control_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3i32.to_be_bytes());
        bytes.push(0);
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::InvalidUtf8(_))
        ));
    }
}
