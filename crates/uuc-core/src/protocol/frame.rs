//! Fixed-size frames used on the bulk-endpoint transport.
//!
//! A frame is a 4-byte ASCII tag followed by at most 60 payload bytes.
//! Frames are written with their exact length; readers treat anything after
//! the payload as NUL padding up to 64 bytes.

use std::fmt;

use thiserror::Error;

use super::constants::{
    DATA_LEN_DIGITS, FRAME_TAG_SIZE, MAX_FRAME_DATA_SIZE, MAX_FRAME_SIZE, TAG_DATA, TAG_FAIL,
    TAG_INFO, TAG_OKAY,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {len} bytes")]
    TooShort { len: usize },
    #[error("Frame too long: {len} bytes, maximum {MAX_FRAME_SIZE}")]
    TooLong { len: usize },
    #[error("Unknown frame tag: {0}")]
    UnknownTag(String),
    #[error("Invalid DATA length announcement: {0}")]
    InvalidLength(String),
}

/// Reply tag selecting the frame semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// Non-terminal progress or subprocess output.
    Info,
    /// Terminal success.
    Okay,
    /// Terminal failure.
    Fail,
    /// Length announcement for raw bytes that follow out of band.
    Data,
}

impl FrameTag {
    /// Wire bytes of the tag.
    pub const fn as_bytes(self) -> [u8; 4] {
        match self {
            FrameTag::Info => TAG_INFO,
            FrameTag::Okay => TAG_OKAY,
            FrameTag::Fail => TAG_FAIL,
            FrameTag::Data => TAG_DATA,
        }
    }

    /// Parse a tag from the first four bytes of a frame.
    pub fn from_bytes(bytes: [u8; 4]) -> Option<Self> {
        match bytes {
            TAG_INFO => Some(FrameTag::Info),
            TAG_OKAY => Some(FrameTag::Okay),
            TAG_FAIL => Some(FrameTag::Fail),
            TAG_DATA => Some(FrameTag::Data),
            _ => None,
        }
    }

    /// Whether this tag ends a command cycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, FrameTag::Okay | FrameTag::Fail)
    }
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.as_bytes();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

/// One reply frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: FrameTag,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, truncating the payload to what fits in one frame.
    pub fn new(tag: FrameTag, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_FRAME_DATA_SIZE);
        Self {
            tag,
            payload: payload[..len].to_vec(),
        }
    }

    /// Frame with an empty payload.
    pub fn bare(tag: FrameTag) -> Self {
        Self {
            tag,
            payload: Vec::new(),
        }
    }

    /// DATA frame announcing `len` bytes as `%08X`.
    pub fn data_header(len: u32) -> Self {
        Self {
            tag: FrameTag::Data,
            payload: format!("{len:08X}").into_bytes(),
        }
    }

    /// Split a long payload into consecutive frames of the same tag.
    ///
    /// An empty payload still yields one bare frame.
    pub fn split(tag: FrameTag, payload: &[u8]) -> Vec<Self> {
        if payload.is_empty() {
            return vec![Self::bare(tag)];
        }
        payload
            .chunks(MAX_FRAME_DATA_SIZE)
            .map(|chunk| Self::new(tag, chunk))
            .collect()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Encode as tag + payload (never more than 64 bytes).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_TAG_SIZE + self.payload.len());
        buf.extend_from_slice(&self.tag.as_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame, stripping NUL padding from the payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_TAG_SIZE {
            return Err(FrameError::TooShort { len: bytes.len() });
        }
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLong { len: bytes.len() });
        }
        let tag_bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
        let tag = FrameTag::from_bytes(tag_bytes)
            .ok_or_else(|| FrameError::UnknownTag(String::from_utf8_lossy(&tag_bytes).into()))?;
        let payload = trim_padding(&bytes[FRAME_TAG_SIZE..]);
        Ok(Self {
            tag,
            payload: payload.to_vec(),
        })
    }

    /// Parse the byte count carried by a DATA frame.
    pub fn parse_data_len(&self) -> Result<u32, FrameError> {
        let text = String::from_utf8_lossy(&self.payload);
        if self.tag != FrameTag::Data || self.payload.len() != DATA_LEN_DIGITS {
            return Err(FrameError::InvalidLength(text.into()));
        }
        u32::from_str_radix(&text, 16).map_err(|_| FrameError::InvalidLength(text.into()))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame({} {:?})",
            self.tag,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

/// Strip trailing NUL bytes.
pub fn trim_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_ascii() {
        assert_eq!(FrameTag::Info.to_string(), "INFO");
        assert_eq!(FrameTag::from_bytes(*b"OKAY"), Some(FrameTag::Okay));
        assert_eq!(FrameTag::from_bytes(*b"NOPE"), None);
        assert!(FrameTag::Fail.is_terminal());
        assert!(!FrameTag::Data.is_terminal());
    }

    #[test]
    fn test_encode_is_exact_length() {
        let frame = Frame::new(FrameTag::Fail, b"EPIPE");
        assert_eq!(frame.encode(), b"FAILEPIPE");
        assert_eq!(Frame::bare(FrameTag::Okay).encode(), b"OKAY");
    }

    #[test]
    fn test_payload_truncated_to_frame() {
        let long = vec![b'x'; 100];
        let frame = Frame::new(FrameTag::Info, &long);
        assert_eq!(frame.payload().len(), MAX_FRAME_DATA_SIZE);
        assert_eq!(frame.encode().len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_decode_strips_padding() {
        let mut raw = [0u8; MAX_FRAME_SIZE];
        raw[..4].copy_from_slice(b"INFO");
        raw[4..9].copy_from_slice(b"hello");
        let frame = Frame::decode(&raw).unwrap();
        assert_eq!(frame.tag, FrameTag::Info);
        assert_eq!(frame.payload(), b"hello");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(Frame::decode(b"OK"), Err(FrameError::TooShort { len: 2 }));
        assert!(matches!(
            Frame::decode(b"WHAT"),
            Err(FrameError::UnknownTag(_))
        ));
        assert!(matches!(
            Frame::decode(&[b'A'; 65]),
            Err(FrameError::TooLong { len: 65 })
        ));
    }

    #[test]
    fn test_data_header() {
        let frame = Frame::data_header(0x1234);
        assert_eq!(frame.encode(), b"DATA00001234");
        assert_eq!(frame.parse_data_len().unwrap(), 0x1234);
        assert!(Frame::new(FrameTag::Data, b"12").parse_data_len().is_err());
    }

    #[test]
    fn test_split_long_info() {
        let text = vec![b'a'; 130];
        let frames = Frame::split(FrameTag::Info, &text);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].payload().len(), 10);
        assert_eq!(Frame::split(FrameTag::Info, b"").len(), 1);
    }
}
