//! `/dev/utp` message transport.
//!
//! The gadget driver delivers one whole message per `read` and accepts one
//! whole reply per `write`. There are no INFO frames and no bulk stream:
//! data arrives as DATA messages and goes straight into the open target.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::traits::{Inbound, Transport, TransportError};
use crate::devnode::{self, NodeKind};
use crate::protocol::message::MESSAGE_MAX_SIZE;
use crate::protocol::{Command, MessageBody, Reply, UTP_IOCTL_BASE, UtpMessage};

nix::ioctl_read!(utp_get_cpu_id, UTP_IOCTL_BASE, 0, i32);

/// Transport over the UTP character device.
pub struct UtpTransport<D: Read + Write> {
    device: D,
    buf: Vec<u8>,
}

impl UtpTransport<File> {
    /// Wait until the device node can be created from sysfs, then open it.
    ///
    /// Retries every `retry` forever; the gadget driver may load late.
    #[instrument(level = "info", skip(sys_root))]
    pub fn wait_and_open(
        node: &Path,
        sys_root: &Path,
        retry: Duration,
    ) -> Result<Self, TransportError> {
        info!("Waiting for device to appear");
        let mut attempts = 0u64;
        while let Err(e) = devnode::mk_devnode(sys_root, "class/misc", "utp", node, NodeKind::Char)
        {
            attempts += 1;
            debug!(attempts, error = %e, "UTP device not ready");
            thread::sleep(retry);
        }
        Self::open(node)
    }

    pub fn open(node: &Path) -> Result<Self, TransportError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(node)
            .map_err(|source| TransportError::OpenFailed {
                path: node.display().to_string(),
                source,
            })?;
        info!(node = %node.display(), "UTP device opened");
        Ok(Self::from_device(device))
    }

    /// SoC identifier reported by the gadget driver.
    pub fn cpu_id(&self) -> Result<i32, TransportError> {
        let mut id: i32 = 0;
        // SAFETY: the fd is owned by `self.device` and `id` outlives the call.
        unsafe { utp_get_cpu_id(self.device.as_raw_fd(), &mut id) }
            .map_err(|e| TransportError::ReadFailed(io::Error::from(e)))?;
        Ok(id)
    }
}

impl<D: Read + Write> UtpTransport<D> {
    pub fn from_device(device: D) -> Self {
        Self {
            device,
            buf: vec![0u8; MESSAGE_MAX_SIZE],
        }
    }

    pub fn into_device(self) -> D {
        self.device
    }

    fn write_message(&mut self, message: &UtpMessage) -> Result<(), TransportError> {
        let bytes = message.encode()?;
        info!(kind = message.kind(), size = bytes.len(), "Sending reply");
        self.device
            .write_all(&bytes)
            .map_err(TransportError::WriteFailed)
    }
}

impl<D: Read + Write> Transport for UtpTransport<D> {
    fn receive(&mut self) -> Result<Inbound, TransportError> {
        let n = match self.device.read(&mut self.buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Inbound::Idle),
            Err(e) => return Err(TransportError::ReadFailed(e)),
        };
        if n == 0 {
            return Ok(Inbound::Idle);
        }
        let message = UtpMessage::decode(&self.buf[..n])?;
        match message.body {
            MessageBody::Command { argument, text } if !text.is_empty() => {
                Ok(Inbound::Command(Command::new(text, argument)))
            }
            MessageBody::Data(bytes) => Ok(Inbound::Data(bytes)),
            _ => {
                warn!(flags = %format!("{:#x}", message.flags), "Unknown message flags");
                Ok(Inbound::Idle)
            }
        }
    }

    fn send(&mut self, reply: &Reply) -> Result<(), TransportError> {
        match reply {
            Reply::Info(text) => {
                if !text.is_empty() {
                    debug!(output = %String::from_utf8_lossy(text).trim_end(), "Subprocess output");
                }
                Ok(())
            }
            Reply::Busy => self.write_message(&UtpMessage::busy()),
            Reply::Okay(_) => self.write_message(&UtpMessage::success()),
            Reply::Fail { .. } => self.write_message(&UtpMessage::status(reply.status())),
            Reply::Data(bytes) => self.write_message(&UtpMessage::data(bytes.clone())),
            Reply::DataHeader(_) => Err(TransportError::Unsupported {
                transport: "utp",
                operation: "DATA announcement",
            }),
        }
    }

    fn read_bulk(&mut self, _max_len: usize) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unsupported {
            transport: "utp",
            operation: "bulk read",
        })
    }

    fn write_bulk(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::Unsupported {
            transport: "utp",
            operation: "bulk write",
        })
    }

    fn name(&self) -> &'static str {
        "utp"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::message::{MESSAGE_BASE_SIZE, MESSAGE_HEADER_SIZE};
    use crate::protocol::{UTP_FLAG_REPORT_BUSY, UTP_FLAG_STATUS};

    /// Character device stand-in: one message per read, one per write.
    #[derive(Default)]
    struct FakeDevice {
        inbound: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
    }

    impl Read for FakeDevice {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(msg) = self.inbound.pop_front() else {
                return Ok(0);
            };
            buf[..msg.len()].copy_from_slice(&msg);
            Ok(msg.len())
        }
    }

    impl Write for FakeDevice {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn flags_of(bytes: &[u8]) -> u32 {
        u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test]
    fn test_receive_command_and_data() {
        let mut dev = FakeDevice::default();
        dev.inbound
            .push_back(UtpMessage::command("wrf3", 1024).encode().unwrap());
        dev.inbound
            .push_back(UtpMessage::data(vec![9; 16]).encode().unwrap());
        let mut t = UtpTransport::from_device(dev);

        assert_eq!(
            t.receive().unwrap(),
            Inbound::Command(Command::new("wrf3", 1024))
        );
        assert_eq!(t.receive().unwrap(), Inbound::Data(vec![9; 16]));
        assert_eq!(t.receive().unwrap(), Inbound::Idle);
    }

    #[test]
    fn test_reply_rendering() {
        let mut t = UtpTransport::from_device(FakeDevice::default());
        t.send(&Reply::Busy).unwrap();
        t.send(&Reply::Info(b"progress".to_vec())).unwrap();
        t.send(&Reply::okay()).unwrap();
        t.send(&Reply::fail(-22)).unwrap();
        t.send(&Reply::Data(b"<DEVICE>\0".to_vec())).unwrap();

        let written = t.into_device().written;
        // INFO is local only.
        assert_eq!(written.len(), 4);
        assert_eq!(flags_of(&written[0]), UTP_FLAG_REPORT_BUSY);
        assert_eq!(written[0].len(), MESSAGE_BASE_SIZE);
        assert_eq!(flags_of(&written[1]), 0);
        assert_eq!(flags_of(&written[2]), UTP_FLAG_STATUS);
        assert_eq!(
            &written[2][MESSAGE_HEADER_SIZE..MESSAGE_HEADER_SIZE + 4],
            &(-22i32).to_ne_bytes()
        );
        let data = UtpMessage::decode(&written[3]).unwrap();
        assert_eq!(data.body, MessageBody::Data(b"<DEVICE>\0".to_vec()));
    }

    #[test]
    fn test_bulk_is_unsupported() {
        let mut t = UtpTransport::from_device(FakeDevice::default());
        assert!(matches!(
            t.read_bulk(64),
            Err(TransportError::Unsupported { .. })
        ));
        assert!(t.send(&Reply::DataHeader(4)).is_err());
    }
}
