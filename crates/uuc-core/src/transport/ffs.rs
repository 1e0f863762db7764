//! FunctionFS bulk-endpoint transport.
//!
//! `ep0` receives the descriptor blobs once; afterwards commands arrive on
//! the source endpoint (`ep2`) and every reply leaves through the sink
//! endpoint (`ep1`) as a 4-byte tag plus at most 60 bytes of payload.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::descriptors;
use super::traits::{Inbound, Transport, TransportError};
use crate::protocol::{Command, Frame, FrameTag, MAX_COMMAND_SIZE, Reply};

/// Transport over a pair of bulk endpoints.
///
/// Generic over the endpoint handles so the framing can be exercised
/// against in-memory readers and writers.
pub struct FfsTransport<R: Read, W: Write> {
    source: R,
    sink: W,
    /// Held open for the lifetime of the function; closing it unbinds.
    _control: Option<File>,
}

impl FfsTransport<File, File> {
    /// Open `ep0`, register descriptors, then open `ep1`/`ep2` next to it.
    #[instrument(level = "info")]
    pub fn open(ep0: &Path) -> Result<Self, TransportError> {
        let mut control = open_rw(ep0)?;

        let blob = descriptors::descriptors().map_err(TransportError::WriteFailed)?;
        control
            .write_all(&blob)
            .map_err(TransportError::WriteFailed)?;
        let strings = descriptors::strings().map_err(TransportError::WriteFailed)?;
        control
            .write_all(&strings)
            .map_err(TransportError::WriteFailed)?;
        info!(descriptors = blob.len(), strings = strings.len(), "FunctionFS descriptors written");

        let sink = open_rw(&sibling_endpoint(ep0, 1))?;
        let source = open_rw(&sibling_endpoint(ep0, 2))?;
        info!("Bulk endpoints opened");

        Ok(Self {
            source,
            sink,
            _control: Some(control),
        })
    }
}

impl<R: Read, W: Write> FfsTransport<R, W> {
    /// Wrap already-open endpoints (no descriptor setup).
    pub fn from_endpoints(source: R, sink: W) -> Self {
        Self {
            source,
            sink,
            _control: None,
        }
    }

    /// Consume the transport and hand back the endpoints.
    pub fn into_endpoints(self) -> (R, W) {
        (self.source, self.sink)
    }

    fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        debug!(frame = ?frame, "Sending frame");
        self.sink
            .write_all(&frame.encode())
            .and_then(|_| self.sink.flush())
            .map_err(TransportError::WriteFailed)
    }
}

impl<R: Read, W: Write> Transport for FfsTransport<R, W> {
    fn receive(&mut self) -> Result<Inbound, TransportError> {
        let mut buf = [0u8; MAX_COMMAND_SIZE + 1];
        let n = match self.source.read(&mut buf[..MAX_COMMAND_SIZE]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Inbound::Idle),
            Err(e) => return Err(TransportError::ReadFailed(e)),
        };
        if n == 0 {
            return Ok(Inbound::Idle);
        }
        match Command::from_frame(&buf[..n]) {
            Some(cmd) => Ok(Inbound::Command(cmd)),
            None => {
                warn!(len = n, "Ignoring empty command");
                Ok(Inbound::Idle)
            }
        }
    }

    fn send(&mut self, reply: &Reply) -> Result<(), TransportError> {
        match reply {
            Reply::Info(text) => {
                for frame in Frame::split(FrameTag::Info, text) {
                    self.write_frame(&frame)?;
                }
                Ok(())
            }
            Reply::Busy => self.write_frame(&Frame::bare(FrameTag::Info)),
            Reply::DataHeader(len) => self.write_frame(&Frame::data_header(*len)),
            Reply::Okay(payload) => self.write_frame(&Frame::new(FrameTag::Okay, payload)),
            Reply::Fail { detail, .. } => self.write_frame(&Frame::new(FrameTag::Fail, detail)),
            Reply::Data(bytes) => {
                self.write_frame(&Frame::data_header(data_len(bytes.len())?))?;
                if !bytes.is_empty() {
                    self.write_bulk(bytes)?;
                }
                self.write_frame(&Frame::bare(FrameTag::Okay))
            }
        }
    }

    fn read_bulk(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; max_len];
        loop {
            match self.source.read(&mut buf) {
                Ok(n) => {
                    buf.truncate(n);
                    debug!(bytes_read = n, "Bulk read complete");
                    return Ok(buf);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::ReadFailed(e)),
            }
        }
    }

    fn write_bulk(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.sink
            .write_all(data)
            .and_then(|_| self.sink.flush())
            .map_err(TransportError::WriteFailed)?;
        debug!(bytes_written = data.len(), "Bulk write complete");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ffs"
    }
}

/// Length field of a DATA header; payloads past `u32::MAX` cannot be framed.
fn data_len(len: usize) -> Result<u32, TransportError> {
    u32::try_from(len).map_err(|_| TransportError::Unsupported {
        transport: "ffs",
        operation: "DATA reply larger than 4 GiB",
    })
}

fn open_rw(path: &Path) -> Result<File, TransportError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| match source.kind() {
            io::ErrorKind::NotFound => TransportError::DeviceNotFound(path.display().to_string()),
            _ => TransportError::OpenFailed {
                path: path.display().to_string(),
                source,
            },
        })
}

/// `/dev/usb-ffs/ep0` -> `/dev/usb-ffs/ep<n>`.
fn sibling_endpoint(ep0: &Path, index: u8) -> PathBuf {
    let name = ep0
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix('0').unwrap_or(&name);
    ep0.with_file_name(format!("{stem}{index}"))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Source that returns one queued USB transfer per `read`.
    struct Transfers(VecDeque<Vec<u8>>);

    impl Read for Transfers {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(chunk) = self.0.pop_front() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    /// Sink that keeps every `write` call separate, like USB transfers.
    #[derive(Default)]
    struct Writes(Vec<Vec<u8>>);

    impl Write for Writes {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn transport(transfers: Vec<&[u8]>) -> FfsTransport<Transfers, Writes> {
        let queue = transfers.into_iter().map(|t| t.to_vec()).collect();
        FfsTransport::from_endpoints(Transfers(queue), Writes::default())
    }

    /// Host-side reassembly: DATA header, raw bytes up to the length, OKAY.
    fn host_read_data(writes: &[Vec<u8>]) -> Vec<u8> {
        let header = Frame::decode(&writes[0]).unwrap();
        let len = header.parse_data_len().unwrap() as usize;
        let mut data = Vec::new();
        let mut idx = 1;
        while data.len() < len {
            data.extend_from_slice(&writes[idx]);
            idx += 1;
        }
        assert_eq!(data.len(), len);
        let trailer = Frame::decode(&writes[idx]).unwrap();
        assert_eq!(trailer.tag, FrameTag::Okay);
        assert_eq!(idx + 1, writes.len());
        data
    }

    #[test]
    fn test_receive_command() {
        let mut padded = vec![0u8; 64];
        padded[..8].copy_from_slice(b"download");
        let mut t = transport(vec![&padded, b"", b"\0\0\0"]);

        match t.receive().unwrap() {
            Inbound::Command(cmd) => assert_eq!(cmd.text, "download"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(t.receive().unwrap(), Inbound::Idle);
        assert_eq!(t.receive().unwrap(), Inbound::Idle);
    }

    #[test]
    fn test_data_reply_round_trip() {
        for n in [0usize, 1, 63, 64, 647] {
            let payload: Vec<u8> = (0..n).map(|i| (i * 7 % 251) as u8).collect();
            let mut t = transport(vec![]);
            t.send(&Reply::Data(payload.clone())).unwrap();
            let (_, sink) = t.into_endpoints();
            assert_eq!(host_read_data(&sink.0), payload, "length {n}");
        }
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_data_len_limit() {
        assert_eq!(data_len(0).unwrap(), 0);
        assert_eq!(data_len(u32::MAX as usize).unwrap(), u32::MAX);
        let err = data_len(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, TransportError::Unsupported { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_long_info_is_split() {
        let mut t = transport(vec![]);
        t.send(&Reply::Info(vec![b'x'; 125])).unwrap();
        let (_, sink) = t.into_endpoints();
        assert_eq!(sink.0.len(), 3);
        assert!(sink.0.iter().all(|w| w.len() <= 64 && w.starts_with(b"INFO")));
        assert_eq!(sink.0[2].len(), 4 + 5);
    }

    #[test]
    fn test_terminal_frames() {
        let mut t = transport(vec![]);
        t.send(&Reply::Busy).unwrap();
        t.send(&Reply::fail_with(-32, b"EPIPE")).unwrap();
        t.send(&Reply::Okay(b"0000000000000010".to_vec())).unwrap();
        t.send(&Reply::DataHeader(0x200)).unwrap();
        let (_, sink) = t.into_endpoints();
        assert_eq!(sink.0[0], b"INFO");
        assert_eq!(sink.0[1], b"FAILEPIPE");
        assert_eq!(sink.0[2], b"OKAY0000000000000010");
        assert_eq!(sink.0[3], b"DATA00000200");
    }

    #[test]
    fn test_read_bulk_short_transfer() {
        let mut t = transport(vec![&[1, 2, 3]]);
        assert_eq!(t.read_bulk(0x80).unwrap(), vec![1, 2, 3]);
        assert!(t.read_bulk(0x80).unwrap().is_empty());
    }

    #[test]
    fn test_sibling_endpoint() {
        assert_eq!(
            sibling_endpoint(Path::new("/dev/usb-ffs/ep0"), 2),
            PathBuf::from("/dev/usb-ffs/ep2")
        );
    }
}
