//! Bulk data movement between the host and the current target.
//!
//! Download: the host announces a size, the device echoes it in a DATA
//! frame, reads the bytes from the source endpoint and writes them to the
//! target in slices, sending an INFO heartbeat after each slice.
//!
//! Upload: the device reads one chunk from the target and returns it as a
//! DATA reply. A source with nothing ready yet gets a zero-length DATA
//! announcement so the host can retry.

use std::io::{self, Read, Write};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, StdoutRead};
use crate::events::{UucEvent, UucObserver};
use crate::protocol::{CACHE_LINE, DETAIL_DIR, DETAIL_EPIPE, Reply, STATUS_FAILURE, WRITE_SLICE};
use crate::state::machine::{SessionState, Target, TransferSession};
use crate::transport::{Transport, TransportError};

/// Transient bulk read errors tolerated before giving up.
pub const MAX_READ_RETRIES: usize = 5;

/// How long `upload` waits for subprocess output before announcing 0 bytes.
pub const UPLOAD_WAIT: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No open target for {0}")]
    NoTarget(&'static str),

    #[error("Size mismatch: declared {declared}, received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("Target is a directory")]
    Directory,

    #[error("Streaming write failed earlier: {0}")]
    Deferred(String),

    #[error("Target I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TransferError {
    /// Status code reported to the host.
    pub fn status(&self) -> i32 {
        match self {
            TransferError::Io(e) => e.raw_os_error().map_or(STATUS_FAILURE, |errno| -errno),
            TransferError::Bridge(e) => e.status(),
            _ => STATUS_FAILURE,
        }
    }

    /// Short FAIL detail understood by the host.
    pub fn detail(&self) -> &'static [u8] {
        match self {
            TransferError::Bridge(BridgeError::BrokenPipe) => DETAIL_EPIPE,
            TransferError::Directory => DETAIL_DIR,
            _ => b"",
        }
    }
}

/// Round a receive buffer up to the cache line.
pub fn aligned_len(size: usize) -> usize {
    (size + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}

/// Receive `declared` bytes from the host and write them to the target.
///
/// Sends the DATA announcement and the per-slice heartbeats; the caller
/// sends the terminal reply. Pending subprocess output is forwarded as INFO
/// whether or not the transfer succeeded.
pub fn download<T: Transport + ?Sized>(
    transport: &mut T,
    state: &mut SessionState,
    observer: &dyn UucObserver,
    declared: u32,
) -> Result<u64, TransferError> {
    match &state.target {
        Some(target) if target.is_writable() => {}
        _ => return Err(TransferError::NoTarget("download")),
    }

    transport.send(&Reply::DataHeader(declared))?;

    let result = receive_and_store(transport, state, observer, declared as usize);
    forward_pending_output(transport, state)?;

    let received = result?;
    info!(bytes = received, "Download complete");
    Ok(received)
}

fn receive_and_store<T: Transport + ?Sized>(
    transport: &mut T,
    state: &mut SessionState,
    observer: &dyn UucObserver,
    declared: usize,
) -> Result<u64, TransferError> {
    let data = receive_bulk(transport, declared)?;
    let mut session = TransferSession::new(declared as u64);
    session.record(data.len());

    if !session.is_complete() {
        warn!(declared, received = data.len(), "Download size mismatch");
        return Err(TransferError::SizeMismatch {
            declared: declared as u64,
            received: data.len() as u64,
        });
    }

    // Pipe output seen while writing goes out as INFO; empty chunks are
    // plain heartbeats.
    write_target(state, &data, |chunk| {
        transport.send(&Reply::Info(chunk))?;
        Ok(())
    })?;
    observer.on_event(&UucEvent::Progress {
        operation: "download",
        current: data.len() as u64,
        total: declared as u64,
    });
    // Downloads feeding a pipe count towards the stream it declared.
    if let Some(stream) = state.transfer.as_mut() {
        stream.record(data.len());
    }
    Ok(session.transferred)
}

/// Read one host transfer into an aligned buffer.
///
/// A read shorter than requested ends the transfer.
fn receive_bulk<T: Transport + ?Sized>(
    transport: &mut T,
    declared: usize,
) -> Result<Vec<u8>, TransferError> {
    if declared == 0 {
        return Ok(Vec::new());
    }
    let capacity = aligned_len(declared);
    let mut data = Vec::with_capacity(capacity);
    let mut retries = 0;

    while data.len() < declared {
        let want = capacity - data.len();
        match transport.read_bulk(want) {
            Ok(chunk) => {
                let short = chunk.len() < want;
                debug!(len = chunk.len(), want, "Bulk chunk received");
                data.extend_from_slice(&chunk);
                if short {
                    break;
                }
            }
            Err(e) if e.is_retryable() && retries < MAX_READ_RETRIES => {
                retries += 1;
                warn!(error = %e, retries, "Transient bulk read error, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(data)
}

/// Write `bytes` into the current write target.
///
/// `sink` gets pipe output and empty heartbeat chunks, as in
/// [`Bridge::write_stdin`](crate::bridge::Bridge::write_stdin).
fn write_target(
    state: &mut SessionState,
    bytes: &[u8],
    mut sink: impl FnMut(Vec<u8>) -> Result<(), TransferError>,
) -> Result<usize, TransferError> {
    if let Some(Target::BridgeStdin) = state.target {
        return match state.bridge_mut() {
            Some(bridge) => bridge.write_stdin(bytes, sink),
            None => Err(BridgeError::BrokenPipe.into()),
        };
    }
    match &mut state.target {
        Some(Target::File { file, .. }) => {
            for slice in bytes.chunks(WRITE_SLICE) {
                file.write_all(slice)?;
                sink(Vec::new())?;
            }
            Ok(bytes.len())
        }
        _ => Err(TransferError::NoTarget("write")),
    }
}

/// Forward whatever the bridged subprocess printed as INFO.
fn forward_pending_output<T: Transport + ?Sized>(
    transport: &mut T,
    state: &mut SessionState,
) -> Result<(), TransportError> {
    if let Some(bridge) = state.bridge_mut() {
        for chunk in bridge.drain_stdout(Duration::ZERO).chunks {
            transport.send(&Reply::Info(chunk))?;
        }
    }
    Ok(())
}

/// Append one DATA message (message transport) to the current target.
///
/// There is no reply; failures are kept and reported by the next sync.
pub fn append_data(state: &mut SessionState, bytes: &[u8]) -> Result<(), TransferError> {
    let result = write_target(state, bytes, |chunk| {
        if !chunk.is_empty() {
            debug!(output = %String::from_utf8_lossy(&chunk).trim_end(), "Subprocess output");
        }
        Ok(())
    });
    let session = state
        .transfer
        .get_or_insert_with(|| TransferSession::new(0));
    match result {
        Ok(n) => {
            session.record(n);
            Ok(())
        }
        Err(e) => {
            if session.failure.is_none() {
                session.failure = Some(e.to_string());
            }
            Err(e)
        }
    }
}

/// Check the streaming transfer declared by `wrf`/`wrs` and clear it.
pub fn finish_stream(state: &mut SessionState) -> Result<(), TransferError> {
    let Some(session) = state.transfer.take() else {
        return Ok(());
    };
    if let Some(failure) = session.failure {
        return Err(TransferError::Deferred(failure));
    }
    if !session.is_complete() {
        return Err(TransferError::SizeMismatch {
            declared: session.total_size,
            received: session.transferred,
        });
    }
    Ok(())
}

/// Read at most `max` bytes from the read target.
///
/// Returns the terminal reply: DATA with the bytes (empty at EOF).
pub fn upload<T: Transport + ?Sized>(
    transport: &mut T,
    state: &mut SessionState,
    max: usize,
) -> Result<Reply, TransferError> {
    if let Some(Target::BridgeStdout) = state.target {
        let Some(bridge) = state.bridge_mut() else {
            return Ok(Reply::Data(Vec::new()));
        };
        loop {
            match bridge.read_stdout(max, UPLOAD_WAIT) {
                StdoutRead::Data(bytes) => return Ok(Reply::Data(bytes)),
                StdoutRead::Eof => return Ok(Reply::Data(Vec::new())),
                StdoutRead::WouldBlock => announce_empty(transport)?,
            }
        }
    }
    let Some(Target::Reader { file, .. }) = &mut state.target else {
        return Err(TransferError::NoTarget("upload"));
    };
    let mut buf = vec![0u8; max];
    let n = loop {
        match file.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => announce_empty(transport)?,
            Err(e) => return Err(e.into()),
        }
    };
    buf.truncate(n);
    debug!(bytes = n, "Upload chunk read");
    Ok(Reply::Data(buf))
}

/// `DATA 00000000`: nothing yet, ask again.
fn announce_empty<T: Transport + ?Sized>(transport: &mut T) -> Result<(), TransferError> {
    match transport.send(&Reply::DataHeader(0)) {
        Ok(()) | Err(TransportError::Unsupported { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};

    use super::*;
    use crate::bridge::StdinMode;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    fn file_target(dir: &tempfile::TempDir) -> (SessionState, std::path::PathBuf) {
        let path = dir.path().join("target.bin");
        let mut state = SessionState::new();
        state.set_write_file(File::create(&path).unwrap(), &path);
        (state, path)
    }

    #[test]
    fn test_aligned_len() {
        assert_eq!(aligned_len(0), 0);
        assert_eq!(aligned_len(1), 0x80);
        assert_eq!(aligned_len(0x80), 0x80);
        assert_eq!(aligned_len(0x81), 0x100);
    }

    #[test]
    fn test_download_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, path) = file_target(&dir);
        state.transfer = Some(TransferSession::new(0));
        let mut mock = MockTransport::new();
        let payload: Vec<u8> = (0..647u32).map(|i| i as u8).collect();
        mock.queue_bulk(&payload);

        let n = download(&mut mock, &mut state, &NullObserver, 647).unwrap();
        assert_eq!(n, 647);
        assert_eq!(state.transfer.as_ref().unwrap().transferred, 647);
        state.close_target();
        assert_eq!(fs::read(&path).unwrap(), payload);

        let replies = mock.replies();
        assert_eq!(replies[0], Reply::DataHeader(647));
        assert!(replies[1..].iter().all(|r| !r.is_terminal()));
    }

    #[test]
    fn test_download_short_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, _) = file_target(&dir);
        let mut mock = MockTransport::new();
        mock.queue_bulk(&[7u8; 99]);

        let err = download(&mut mock, &mut state, &NullObserver, 100).unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeMismatch {
                declared: 100,
                received: 99
            }
        ));
    }

    #[test]
    fn test_download_without_target() {
        let mut state = SessionState::new();
        let mut mock = MockTransport::new();
        let err = download(&mut mock, &mut state, &NullObserver, 4).unwrap_err();
        assert!(matches!(err, TransferError::NoTarget(_)));
        assert!(mock.replies().is_empty());
    }

    #[test]
    fn test_download_into_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("piped");
        let mut state = SessionState::new();
        state
            .spawn_bridge(&format!("cat > {}", out.display()), StdinMode::Piped, &[])
            .unwrap();
        state.target = Some(Target::BridgeStdin);
        let mut mock = MockTransport::new();
        mock.queue_bulk(b"rootfs");

        assert_eq!(download(&mut mock, &mut state, &NullObserver, 6).unwrap(), 6);
        let mut bridge = state.take_bridge().unwrap();
        assert_eq!(bridge.close().unwrap(), 0);
        assert_eq!(fs::read(&out).unwrap(), b"rootfs");
    }

    #[test]
    fn test_streaming_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let (mut state, _) = file_target(&dir);
        state.transfer = Some(TransferSession::new(8));
        append_data(&mut state, b"1234").unwrap();
        assert!(matches!(
            finish_stream(&mut state),
            Err(TransferError::SizeMismatch { .. })
        ));

        state.transfer = Some(TransferSession::new(4));
        append_data(&mut state, b"1234").unwrap();
        assert!(finish_stream(&mut state).is_ok());
        assert!(state.transfer.is_none());
    }

    #[test]
    fn test_upload_file_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src");
        fs::write(&path, b"hello").unwrap();
        let mut state = SessionState::new();
        state.target = Some(Target::Reader {
            file: File::open(&path).unwrap(),
            path: path.clone(),
        });
        let mut mock = MockTransport::new();

        assert_eq!(
            upload(&mut mock, &mut state, 0x10000).unwrap(),
            Reply::Data(b"hello".to_vec())
        );
        assert_eq!(
            upload(&mut mock, &mut state, 0x10000).unwrap(),
            Reply::Data(Vec::new())
        );
    }

    #[test]
    fn test_upload_waits_for_output() {
        let mut state = SessionState::new();
        state
            .spawn_bridge("sleep 0.2; printf late", StdinMode::Null, &[])
            .unwrap();
        state.target = Some(Target::BridgeStdout);
        let mut mock = MockTransport::new();

        let reply = upload(&mut mock, &mut state, 0x10000).unwrap();
        assert_eq!(reply, Reply::Data(b"late".to_vec()));
        // At least one "nothing yet" announcement while the child slept.
        assert!(mock.replies().contains(&Reply::DataHeader(0)));
    }
}
