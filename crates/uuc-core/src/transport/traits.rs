//! Transport layer abstraction.
//!
//! Defines the `Transport` trait for the host channel, allowing different
//! implementations (FunctionFS bulk endpoints, UTP character device, mock).

use std::io;

use thiserror::Error;

use crate::protocol::{Command, MessageError, Reply};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open {path}: {source}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("Read failed: {0}")]
    ReadFailed(#[source] io::Error),

    #[error("Host disconnected")]
    Disconnected,

    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        transport: &'static str,
        operation: &'static str,
    },

    #[error("Malformed message: {0}")]
    Message(#[from] MessageError),
}

impl TransportError {
    /// Transient conditions that a streaming loop may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::ReadFailed(e) | TransportError::WriteFailed(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
            TransportError::Disconnected => true,
            _ => false,
        }
    }

    /// Errors that leave the control channel unusable.
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
            && !matches!(
                self,
                TransportError::Unsupported { .. } | TransportError::Message(_)
            )
    }
}

/// One item read from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A command to dispatch.
    Command(Command),
    /// Raw data for the current write target (message transport only).
    Data(Vec<u8>),
    /// Nothing usable (empty read, unknown flags).
    Idle,
}

/// Abstract host channel.
///
/// This trait enables:
/// - FunctionFS implementation with fixed 64-byte frames
/// - UTP character device implementation with whole messages
/// - Mock implementation for unit testing
pub trait Transport {
    /// Block until the host sends something.
    fn receive(&mut self) -> Result<Inbound, TransportError>;

    /// Send one reply in the transport's native framing.
    fn send(&mut self, reply: &Reply) -> Result<(), TransportError>;

    /// Read one bulk transfer of at most `max_len` bytes from the host.
    ///
    /// A result shorter than `max_len` means the host ended the transfer.
    fn read_bulk(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Write raw, unframed bytes to the host.
    fn write_bulk(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn receive(&mut self) -> Result<Inbound, TransportError> {
        (**self).receive()
    }

    fn send(&mut self, reply: &Reply) -> Result<(), TransportError> {
        (**self).send(reply)
    }

    fn read_bulk(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read_bulk(max_len)
    }

    fn write_bulk(&mut self, data: &[u8]) -> Result<(), TransportError> {
        (**self).write_bulk(data)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
