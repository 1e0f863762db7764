//! Session state carried across commands.
//!
//! Holds the single subprocess slot, the open transfer target and the
//! streaming transfer bookkeeping. Owned by the command thread.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bridge::{Bridge, BridgeError, ProcessState, StdinMode};
use crate::events::CommandPhase;

/// Where `download`/DATA bytes go, or where `upload` reads from.
#[derive(Debug)]
pub enum Target {
    /// Regular file opened for writing.
    File { file: File, path: PathBuf },
    /// Stdin of the bridged subprocess.
    BridgeStdin,
    /// Regular file opened for reading.
    Reader { file: File, path: PathBuf },
    /// Stdout of the bridged subprocess.
    BridgeStdout,
}

impl Target {
    pub fn is_writable(&self) -> bool {
        matches!(self, Target::File { .. } | Target::BridgeStdin)
    }

    pub fn is_readable(&self) -> bool {
        matches!(self, Target::Reader { .. } | Target::BridgeStdout)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File { path, .. } => write!(f, "write:{}", path.display()),
            Target::BridgeStdin => write!(f, "write:<stdin>"),
            Target::Reader { path, .. } => write!(f, "read:{}", path.display()),
            Target::BridgeStdout => write!(f, "read:<stdout>"),
        }
    }
}

/// Bookkeeping for one host-to-device stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSession {
    /// Declared size; 0 when the host did not announce one.
    pub total_size: u64,
    pub transferred: u64,
    /// First write error seen while streaming, reported at the next sync.
    pub failure: Option<String>,
}

impl TransferSession {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            transferred: 0,
            failure: None,
        }
    }

    pub fn record(&mut self, bytes: usize) {
        self.transferred += bytes as u64;
    }

    /// Whether the declared size (if any) has been moved exactly.
    pub fn is_complete(&self) -> bool {
        self.total_size == 0 || self.transferred == self.total_size
    }
}

/// Explicit daemon session passed to every handler.
#[derive(Debug, Default)]
pub struct SessionState {
    bridge: Option<Bridge>,
    /// Current transfer target.
    pub target: Option<Target>,
    /// Streaming transfer declared by `wrf`/`wrs` or the last download.
    pub transfer: Option<TransferSession>,
    phase: CommandPhase,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> CommandPhase {
        self.phase
    }

    /// Transition to a new phase. Returns the previous one.
    pub fn goto_phase(&mut self, new_phase: CommandPhase) -> CommandPhase {
        debug!(from = %self.phase, to = %new_phase, "Phase transition");
        std::mem::replace(&mut self.phase, new_phase)
    }

    pub fn bridge(&self) -> Option<&Bridge> {
        self.bridge.as_ref()
    }

    pub fn bridge_mut(&mut self) -> Option<&mut Bridge> {
        self.bridge.as_mut()
    }

    /// Fail with `ResourceBusy` while a live child occupies the slot.
    ///
    /// An exited child is reaped and the slot freed.
    pub fn ensure_slot_free(&mut self) -> Result<(), BridgeError> {
        if let Some(bridge) = self.bridge.as_mut() {
            match bridge.poll()? {
                ProcessState::Running => {
                    return Err(BridgeError::ResourceBusy { pid: bridge.pid() });
                }
                ProcessState::Exited(code) => {
                    info!(pid = bridge.pid(), code, "Releasing finished subprocess");
                    self.bridge = None;
                }
            }
        }
        Ok(())
    }

    /// Spawn into the slot. The slot must be free.
    pub fn spawn_bridge(
        &mut self,
        command: &str,
        stdin: StdinMode,
        env: &[(&str, &str)],
    ) -> Result<&mut Bridge, BridgeError> {
        self.ensure_slot_free()?;
        Ok(self.bridge.insert(Bridge::spawn(command, stdin, env)?))
    }

    /// Remove the bridge from the slot (the caller reaps it).
    pub fn take_bridge(&mut self) -> Option<Bridge> {
        if matches!(
            self.target,
            Some(Target::BridgeStdin) | Some(Target::BridgeStdout)
        ) {
            self.target = None;
        }
        self.bridge.take()
    }

    /// Close the current target. Closing the bridge's stdin lets it see EOF.
    pub fn close_target(&mut self) {
        match self.target.take() {
            Some(Target::BridgeStdin) => {
                if let Some(bridge) = self.bridge.as_mut() {
                    bridge.close_stdin();
                }
            }
            Some(target) => debug!(target = %target, "Closed target"),
            None => {}
        }
    }

    /// Replace the target with a file opened for writing.
    pub fn set_write_file(&mut self, file: File, path: &Path) {
        self.target = Some(Target::File {
            file,
            path: path.to_path_buf(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transition() {
        let mut state = SessionState::new();
        assert_eq!(state.phase(), CommandPhase::Idle);
        let prev = state.goto_phase(CommandPhase::Received);
        assert_eq!(prev, CommandPhase::Idle);
        assert_eq!(state.phase(), CommandPhase::Received);
    }

    #[test]
    fn test_single_live_slot() {
        let mut state = SessionState::new();
        let pid = state
            .spawn_bridge("cat", StdinMode::Piped, &[])
            .unwrap()
            .pid();

        let err = state
            .spawn_bridge("true", StdinMode::Null, &[])
            .unwrap_err();
        assert!(matches!(err, BridgeError::ResourceBusy { pid: p } if p == pid));
        // First handle untouched.
        assert_eq!(state.bridge().map(|b| b.pid()), Some(pid));
        assert!(state.bridge().unwrap().has_stdin());

        let mut bridge = state.take_bridge().unwrap();
        assert_eq!(bridge.close().unwrap(), 0);
    }

    #[test]
    fn test_exited_child_frees_slot() {
        let mut state = SessionState::new();
        let bridge = state.spawn_bridge("true", StdinMode::Null, &[]).unwrap();
        bridge.wait().unwrap();
        assert!(state.ensure_slot_free().is_ok());
        assert!(state.bridge().is_none());
    }

    #[test]
    fn test_transfer_completion() {
        let mut t = TransferSession::new(10);
        t.record(4);
        assert!(!t.is_complete());
        t.record(6);
        assert!(t.is_complete());
        assert!(TransferSession::new(0).is_complete());
    }
}
