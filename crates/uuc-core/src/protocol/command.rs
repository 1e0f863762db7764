//! Inbound command decoding.

use std::fmt;

use super::frame::trim_padding;

/// A host command: text plus the optional 64-bit argument of the UTP transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub text: String,
    pub argument: u64,
}

impl Command {
    pub fn new(text: impl Into<String>, argument: u64) -> Self {
        Self {
            text: text.into(),
            argument,
        }
    }

    /// Decode a command read from the bulk source endpoint.
    ///
    /// Trailing NUL padding is dropped. Returns `None` for an empty buffer.
    pub fn from_frame(bytes: &[u8]) -> Option<Self> {
        let trimmed = trim_padding(bytes);
        // Commands are C strings on the wire; anything after a NUL is garbage.
        let end = trimmed
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(trimmed.len());
        if end == 0 {
            return None;
        }
        Some(Self::new(String::from_utf8_lossy(&trimmed[..end]), 0))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.argument == 0 {
            write!(f, "{}", self.text)
        } else {
            write!(f, "{} ({})", self.text, self.argument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trims_padding() {
        let mut raw = [0u8; 512];
        raw[..6].copy_from_slice(b"upload");
        let cmd = Command::from_frame(&raw).unwrap();
        assert_eq!(cmd.text, "upload");
        assert_eq!(cmd.argument, 0);
    }

    #[test]
    fn test_empty_is_ignored() {
        assert!(Command::from_frame(&[]).is_none());
        assert!(Command::from_frame(&[0u8; 64]).is_none());
    }

    #[test]
    fn test_stops_at_embedded_nul() {
        let cmd = Command::from_frame(b"Sync\0junk").unwrap();
        assert_eq!(cmd.text, "Sync");
    }
}
