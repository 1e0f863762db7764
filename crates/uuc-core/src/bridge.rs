//! Subprocess bridge.
//!
//! Runs a shell command with its stdout (and optionally stdin) wired to
//! background threads. The command thread talks to those threads over
//! channels and never blocks longer than a bounded wait, so heartbeats keep
//! flowing to the host while the child works.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::protocol::{STATUS_BUSY, STATUS_EPIPE, STATUS_FAILURE, WRITE_SLICE};

/// Largest chunk forwarded from the child's stdout at once.
pub const STDOUT_CHUNK: usize = 4096;

/// Stdout chunks held before the reader thread stops reading, which in
/// turn blocks a chatty child on its own pipe.
pub const STDOUT_BACKLOG: usize = 16;

/// Poll interval while reaping a child.
const REAP_POLL: Duration = Duration::from_millis(20);

/// Bounded wait for the stdin writer to accept a slice.
pub const STDIN_WAIT: Duration = Duration::from_millis(100);

const SHELL: &str = "/bin/sh";

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Failed to spawn {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Subprocess closed its input")]
    BrokenPipe,

    #[error("Subprocess {pid} is still running")]
    ResourceBusy { pid: u32 },

    #[error("Subprocess has no input pipe")]
    NoStdin,

    #[error("Subprocess I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Status code reported to the host.
    pub fn status(&self) -> i32 {
        match self {
            BridgeError::BrokenPipe => STATUS_EPIPE,
            BridgeError::ResourceBusy { .. } => STATUS_BUSY,
            _ => STATUS_FAILURE,
        }
    }
}

/// Whether the child gets a stdin pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    Piped,
    Null,
}

/// Liveness of the bridged child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
}

/// Output collected by one `drain_stdout` call.
#[derive(Debug, Default)]
pub struct Drained {
    pub chunks: Vec<Vec<u8>>,
    /// The child's stdout reached EOF.
    pub closed: bool,
}

/// Result of a bounded stdout read.
#[derive(Debug, PartialEq, Eq)]
pub enum StdoutRead {
    Data(Vec<u8>),
    /// Nothing available within the wait.
    WouldBlock,
    /// The child closed its stdout.
    Eof,
}

/// A live (or finished but not yet dropped) child process.
pub struct Bridge {
    child: Child,
    command: String,
    stdin_tx: Option<Sender<Vec<u8>>>,
    stdin_done: Option<Receiver<io::Result<usize>>>,
    /// Slices handed to the writer thread whose completion is unread.
    stdin_inflight: usize,
    stdout_rx: Receiver<Vec<u8>>,
    stdout_closed: bool,
    /// Output received but not yet handed out by `read_stdout`.
    pending: Vec<u8>,
    state: ProcessState,
}

impl Bridge {
    /// Run `command` through `/bin/sh -c`.
    #[instrument(level = "info", skip(env))]
    pub fn spawn(
        command: &str,
        stdin: StdinMode,
        env: &[(&str, &str)],
    ) -> Result<Self, BridgeError> {
        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .envs(env.iter().copied())
            .stdin(match stdin {
                StdinMode::Piped => Stdio::piped(),
                StdinMode::Null => Stdio::null(),
            })
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout_rx = match child.stdout.take() {
            Some(out) => spawn_stdout_reader(out),
            None => {
                // Never happens with Stdio::piped(); keep the channel closed.
                let (_, rx) = mpsc::sync_channel(0);
                rx
            }
        };

        let (stdin_tx, stdin_done) = match child.stdin.take() {
            Some(input) => {
                let (tx, done) = spawn_stdin_writer(input);
                (Some(tx), Some(done))
            }
            None => (None, None),
        };

        info!(pid = child.id(), command, "Subprocess started");
        Ok(Self {
            child,
            command: command.to_string(),
            stdin_tx,
            stdin_done,
            stdin_inflight: 0,
            stdout_rx,
            stdout_closed: false,
            pending: Vec::new(),
            state: ProcessState::Running,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin_tx.is_some()
    }

    /// Feed `bytes` to the child's stdin in slices.
    ///
    /// `sink` gets any stdout the child prints while a slice is pending, and
    /// an empty chunk as a heartbeat after every bounded wait and every
    /// completed slice. If `sink` fails mid-slice, the next call settles that
    /// slice before sending its own.
    pub fn write_stdin<E: From<BridgeError>>(
        &mut self,
        bytes: &[u8],
        mut sink: impl FnMut(Vec<u8>) -> Result<(), E>,
    ) -> Result<usize, E> {
        let (Some(tx), Some(done)) = (self.stdin_tx.clone(), self.stdin_done.take()) else {
            return Err(BridgeError::NoStdin.into());
        };

        let mut broken = false;
        let result = self.feed_slices(&tx, &done, bytes, &mut broken, &mut sink);
        drop(tx);
        if broken {
            self.close_stdin();
        } else {
            self.stdin_done = Some(done);
        }
        if let Ok(written) = result {
            debug!(pid = self.pid(), written, "Fed subprocess stdin");
        }
        result
    }

    /// Hand `bytes` to the writer thread slice by slice. Sets `broken` when
    /// the child's input is gone.
    fn feed_slices<E: From<BridgeError>>(
        &mut self,
        tx: &Sender<Vec<u8>>,
        done: &Receiver<io::Result<usize>>,
        bytes: &[u8],
        broken: &mut bool,
        sink: &mut impl FnMut(Vec<u8>) -> Result<(), E>,
    ) -> Result<usize, E> {
        while self.stdin_inflight > 0 {
            self.await_slice(done, broken, sink)?;
        }

        let mut written = 0;
        for slice in bytes.chunks(WRITE_SLICE) {
            if tx.send(slice.to_vec()).is_err() {
                *broken = true;
                return Err(BridgeError::BrokenPipe.into());
            }
            self.stdin_inflight += 1;
            written += self.await_slice(done, broken, sink)?;
            sink(Vec::new())?;
        }
        Ok(written)
    }

    /// Wait for the oldest in-flight slice, draining stdout meanwhile.
    fn await_slice<E: From<BridgeError>>(
        &mut self,
        done: &Receiver<io::Result<usize>>,
        broken: &mut bool,
        sink: &mut impl FnMut(Vec<u8>) -> Result<(), E>,
    ) -> Result<usize, E> {
        loop {
            match done.recv_timeout(STDIN_WAIT) {
                Ok(Ok(n)) => {
                    self.stdin_inflight -= 1;
                    return Ok(n);
                }
                Ok(Err(e)) => {
                    *broken = true;
                    return Err(match e.kind() {
                        io::ErrorKind::BrokenPipe => BridgeError::BrokenPipe,
                        _ => BridgeError::Io(e),
                    }
                    .into());
                }
                Err(RecvTimeoutError::Timeout) => {
                    // A child blocked on a full stdout never finishes reading.
                    for chunk in self.drain_stdout(Duration::ZERO).chunks {
                        sink(chunk)?;
                    }
                    sink(Vec::new())?;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    *broken = true;
                    return Err(BridgeError::BrokenPipe.into());
                }
            }
        }
    }

    /// Close the child's stdin so it sees EOF.
    pub fn close_stdin(&mut self) {
        if self.stdin_tx.take().is_some() {
            debug!(pid = self.pid(), "Closing subprocess stdin");
        }
        self.stdin_done = None;
        self.stdin_inflight = 0;
    }

    /// Collect pending stdout, waiting at most `wait` for the first chunk.
    pub fn drain_stdout(&mut self, wait: Duration) -> Drained {
        if self.pending.is_empty() {
            return self.recv_chunks(wait);
        }
        let held = std::mem::take(&mut self.pending);
        let mut drained = self.recv_chunks(Duration::ZERO);
        drained.chunks.insert(0, held);
        drained
    }

    /// Read at most `max` bytes of stdout, waiting at most `wait`.
    pub fn read_stdout(&mut self, max: usize, wait: Duration) -> StdoutRead {
        if self.pending.is_empty() {
            let drained = self.recv_chunks(wait);
            for chunk in drained.chunks {
                self.pending.extend_from_slice(&chunk);
            }
            if self.pending.is_empty() {
                return if drained.closed {
                    StdoutRead::Eof
                } else {
                    StdoutRead::WouldBlock
                };
            }
        }
        let n = max.min(self.pending.len());
        StdoutRead::Data(self.pending.drain(..n).collect())
    }

    fn recv_chunks(&mut self, wait: Duration) -> Drained {
        let mut drained = Drained {
            closed: self.stdout_closed,
            ..Default::default()
        };
        if self.stdout_closed {
            return drained;
        }

        match self.stdout_rx.recv_timeout(wait) {
            Ok(chunk) => drained.chunks.push(chunk),
            Err(RecvTimeoutError::Timeout) => return drained,
            Err(RecvTimeoutError::Disconnected) => {
                self.stdout_closed = true;
                drained.closed = true;
                return drained;
            }
        }
        // At most one backlog per call; the reader refills while we forward.
        while drained.chunks.len() < STDOUT_BACKLOG {
            match self.stdout_rx.try_recv() {
                Ok(chunk) => drained.chunks.push(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.stdout_closed = true;
                    drained.closed = true;
                    break;
                }
            }
        }
        drained
    }

    /// Non-blocking liveness check; reaps the child once it has exited.
    pub fn poll(&mut self) -> Result<ProcessState, BridgeError> {
        if let ProcessState::Running = self.state
            && let Some(status) = self.child.try_wait()?
        {
            self.mark_exited(status);
        }
        Ok(self.state)
    }

    /// Blocking reap. Output nobody collected is discarded so a child
    /// blocked on a full stdout can still exit.
    pub fn wait(&mut self) -> Result<i32, BridgeError> {
        loop {
            if let ProcessState::Exited(code) = self.poll()? {
                return Ok(code);
            }
            let drained = self.drain_stdout(REAP_POLL);
            let discarded: usize = drained.chunks.iter().map(Vec::len).sum();
            if discarded > 0 {
                debug!(pid = self.pid(), discarded, "Dropping uncollected output");
            }
            if drained.closed {
                thread::sleep(REAP_POLL);
            }
        }
    }

    /// Forward output until the child exits, then return its exit code.
    ///
    /// `sink` receives every stdout chunk, plus an empty chunk as a
    /// heartbeat after each bounded wait.
    pub fn stream_until_exit<E: From<BridgeError>>(
        &mut self,
        wait: Duration,
        mut sink: impl FnMut(Vec<u8>) -> Result<(), E>,
    ) -> Result<i32, E> {
        loop {
            if let Some(code) = self.stream_step(wait, &mut sink)? {
                return Ok(code);
            }
        }
    }

    /// Like [`Bridge::stream_until_exit`], but give up after `timeout`.
    /// Returns `None` if the child is still running.
    pub fn stream_for<E: From<BridgeError>>(
        &mut self,
        timeout: Duration,
        wait: Duration,
        mut sink: impl FnMut(Vec<u8>) -> Result<(), E>,
    ) -> Result<Option<i32>, E> {
        let start = Instant::now();
        loop {
            if let Some(code) = self.stream_step(wait, &mut sink)? {
                return Ok(Some(code));
            }
            if start.elapsed() >= timeout {
                return Ok(None);
            }
        }
    }

    fn stream_step<E: From<BridgeError>>(
        &mut self,
        wait: Duration,
        sink: &mut impl FnMut(Vec<u8>) -> Result<(), E>,
    ) -> Result<Option<i32>, E> {
        let drained = self.drain_stdout(wait);
        for chunk in drained.chunks {
            sink(chunk)?;
        }
        if let ProcessState::Exited(code) = self.poll()? {
            // Output written just before exit.
            loop {
                let tail = self.drain_stdout(Duration::ZERO);
                if tail.chunks.is_empty() {
                    break;
                }
                for chunk in tail.chunks {
                    sink(chunk)?;
                }
            }
            return Ok(Some(code));
        }
        if drained.closed {
            // Nothing left to read; avoid spinning on a closed channel.
            thread::sleep(wait);
        }
        sink(Vec::new())?;
        Ok(None)
    }

    /// Close stdin and reap. Returns the exit code.
    pub fn close(&mut self) -> Result<i32, BridgeError> {
        self.close_stdin();
        self.wait()
    }

    fn mark_exited(&mut self, status: ExitStatus) -> i32 {
        let code = exit_code(status);
        info!(pid = self.pid(), code, "Subprocess exited");
        self.state = ProcessState::Exited(code);
        code
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("pid", &self.pid())
            .field("command", &self.command)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if let ProcessState::Running = self.state {
            self.close_stdin();
            if let Err(e) = self.wait() {
                warn!(pid = self.pid(), error = %e, "Failed to reap subprocess");
            }
        }
    }
}

/// Exit code, or `128 + signal` for a child killed by a signal.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(STATUS_FAILURE)
}

fn spawn_stdout_reader(mut out: ChildStdout) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::sync_channel(STDOUT_BACKLOG);
    thread::spawn(move || {
        let mut buf = [0u8; STDOUT_CHUNK];
        loop {
            match out.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

fn spawn_stdin_writer(mut input: ChildStdin) -> (Sender<Vec<u8>>, Receiver<io::Result<usize>>) {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        for piece in rx {
            let result = input
                .write_all(&piece)
                .and_then(|_| input.flush())
                .map(|_| piece.len());
            let failed = result.is_err();
            if done_tx.send(result).is_err() || failed {
                break;
            }
        }
        // Dropping `input` closes the pipe.
    });
    (tx, done_rx)
}
