//! Variable-size messages exchanged with the UTP character device.
//!
//! Layout (packed, native byte order, must match the gadget driver):
//!
//! ```text
//! u32   flags
//! usize size        total message size including this header
//! union {
//!     { u64 argument; char command[] }   COMMAND
//!     { usize bufsize; u8 data[] }       DATA
//!     i32 status                          STATUS
//! }
//! ```
//!
//! The union occupies at least 9 bytes, so a bare reply is
//! `4 + size_of::<usize>() + 9` bytes long.

use std::io::Cursor;
use std::mem::size_of;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::constants::{
    UTP_FLAG_COMMAND, UTP_FLAG_DATA, UTP_FLAG_REPORT_BUSY, UTP_FLAG_STATUS, UTP_MAX_PAYLOAD,
};

/// `flags` + `size`.
pub const MESSAGE_HEADER_SIZE: usize = size_of::<u32>() + size_of::<usize>();

/// Minimum size of the packed union.
pub const MESSAGE_UNION_SIZE: usize = size_of::<u64>() + 1;

/// Size of a message with no payload.
pub const MESSAGE_BASE_SIZE: usize = MESSAGE_HEADER_SIZE + MESSAGE_UNION_SIZE;

/// Largest inbound message the daemon reads in one call.
pub const MESSAGE_MAX_SIZE: usize = MESSAGE_BASE_SIZE + UTP_MAX_PAYLOAD;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message too short: expected at least {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
    #[error("Payload of {0} bytes exceeds the message limit")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Host command with its 64-bit argument.
    Command { argument: u64, text: String },
    /// Raw data for the current target.
    Data(Vec<u8>),
    /// Non-success status code.
    Status(i32),
    /// Plain success or busy heartbeat.
    Empty,
}

/// One UTP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtpMessage {
    pub flags: u32,
    pub body: MessageBody,
}

impl UtpMessage {
    pub fn command(text: &str, argument: u64) -> Self {
        Self {
            flags: UTP_FLAG_COMMAND,
            body: MessageBody::Command {
                argument,
                text: text.to_string(),
            },
        }
    }

    pub fn data(bytes: Vec<u8>) -> Self {
        Self {
            flags: UTP_FLAG_DATA,
            body: MessageBody::Data(bytes),
        }
    }

    pub fn status(code: i32) -> Self {
        Self {
            flags: UTP_FLAG_STATUS,
            body: MessageBody::Status(code),
        }
    }

    pub fn success() -> Self {
        Self {
            flags: 0,
            body: MessageBody::Empty,
        }
    }

    pub fn busy() -> Self {
        Self {
            flags: UTP_FLAG_REPORT_BUSY,
            body: MessageBody::Empty,
        }
    }

    /// Short human-readable reply type, used in logs.
    pub fn kind(&self) -> &'static str {
        if self.flags & UTP_FLAG_STATUS != 0 {
            "Non-success"
        } else if self.flags & UTP_FLAG_DATA != 0 {
            "Data"
        } else if self.flags & UTP_FLAG_REPORT_BUSY != 0 {
            "Busy"
        } else if self.flags & UTP_FLAG_COMMAND != 0 {
            "Command"
        } else {
            "Success"
        }
    }

    /// Encode into the packed wire layout.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let payload_len = match &self.body {
            MessageBody::Command { text, .. } => text.len() + 1,
            MessageBody::Data(bytes) => bytes.len(),
            MessageBody::Status(_) | MessageBody::Empty => 0,
        };
        if payload_len > UTP_MAX_PAYLOAD {
            return Err(MessageError::TooLarge(payload_len));
        }
        let total = MESSAGE_BASE_SIZE + payload_len;

        let mut buf = Vec::with_capacity(total);
        buf.write_u32::<NativeEndian>(self.flags)?;
        write_usize(&mut buf, total)?;
        match &self.body {
            MessageBody::Command { argument, text } => {
                buf.write_u64::<NativeEndian>(*argument)?;
                buf.extend_from_slice(text.as_bytes());
            }
            MessageBody::Data(bytes) => {
                write_usize(&mut buf, bytes.len())?;
                buf.extend_from_slice(bytes);
            }
            MessageBody::Status(code) => buf.write_i32::<NativeEndian>(*code)?,
            MessageBody::Empty => {}
        }
        buf.resize(total, 0);
        Ok(buf)
    }

    /// Decode one message as delivered by a single read of the device.
    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        if bytes.len() < MESSAGE_HEADER_SIZE {
            return Err(MessageError::TooShort {
                expected: MESSAGE_HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        let mut cursor = Cursor::new(bytes);
        let flags = cursor.read_u32::<NativeEndian>()?;
        let _size = read_usize(&mut cursor)?;
        let body_start = MESSAGE_HEADER_SIZE;

        let body = if flags & UTP_FLAG_COMMAND != 0 {
            let argument = cursor.read_u64::<NativeEndian>()?;
            let text_bytes = &bytes[body_start + size_of::<u64>()..];
            let end = text_bytes
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(text_bytes.len());
            MessageBody::Command {
                argument,
                text: String::from_utf8_lossy(&text_bytes[..end]).into_owned(),
            }
        } else if flags & UTP_FLAG_DATA != 0 {
            let bufsize = read_usize(&mut cursor)?;
            let data_start = body_start + size_of::<usize>();
            let available = bytes.len().saturating_sub(data_start);
            let len = bufsize.min(available);
            MessageBody::Data(bytes[data_start..data_start + len].to_vec())
        } else if flags & UTP_FLAG_STATUS != 0 {
            MessageBody::Status(cursor.read_i32::<NativeEndian>()?)
        } else {
            MessageBody::Empty
        };

        Ok(Self { flags, body })
    }
}

fn write_usize(buf: &mut Vec<u8>, value: usize) -> std::io::Result<()> {
    match size_of::<usize>() {
        8 => buf.write_u64::<NativeEndian>(value as u64),
        _ => buf.write_u32::<NativeEndian>(value as u32),
    }
}

fn read_usize(cursor: &mut Cursor<&[u8]>) -> std::io::Result<usize> {
    match size_of::<usize>() {
        8 => Ok(cursor.read_u64::<NativeEndian>()? as usize),
        _ => Ok(cursor.read_u32::<NativeEndian>()? as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_bare() {
        let bytes = UtpMessage::busy().encode().unwrap();
        assert_eq!(bytes.len(), MESSAGE_BASE_SIZE);
        assert_eq!(&bytes[..4], &UTP_FLAG_REPORT_BUSY.to_ne_bytes());
        let size = &bytes[4..MESSAGE_HEADER_SIZE];
        assert_eq!(size, &MESSAGE_BASE_SIZE.to_ne_bytes());
    }

    #[test]
    fn test_status_layout() {
        let bytes = UtpMessage::status(-22).encode().unwrap();
        let code = &bytes[MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + 4];
        assert_eq!(code, &(-22i32).to_ne_bytes());
        let decoded = UtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.body, MessageBody::Status(-22));
        assert_eq!(decoded.kind(), "Non-success");
    }

    #[test]
    fn test_command_decode() {
        let bytes = UtpMessage::command("wrf3", 4096).encode().unwrap();
        let decoded = UtpMessage::decode(&bytes).unwrap();
        assert_eq!(
            decoded.body,
            MessageBody::Command {
                argument: 4096,
                text: "wrf3".into()
            }
        );
    }

    #[test]
    fn test_data_payload() {
        let payload = b"\x00\x01rootfs".to_vec();
        let bytes = UtpMessage::data(payload.clone()).encode().unwrap();
        assert_eq!(bytes.len(), MESSAGE_BASE_SIZE + payload.len());
        let decoded = UtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.body, MessageBody::Data(payload));
    }

    #[test]
    fn test_data_bufsize_clamped() {
        let mut bytes = UtpMessage::data(vec![7u8; 4]).encode().unwrap();
        bytes.truncate(MESSAGE_HEADER_SIZE + size_of::<usize>() + 2);
        let decoded = UtpMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.body, MessageBody::Data(vec![7, 7]));
    }

    #[test]
    fn test_rejects_short_and_oversized() {
        assert!(UtpMessage::decode(&[1, 0]).is_err());
        let huge = UtpMessage::data(vec![0u8; UTP_MAX_PAYLOAD + 1]);
        assert!(matches!(huge.encode(), Err(MessageError::TooLarge(_))));
    }
}
