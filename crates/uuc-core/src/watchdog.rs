//! Hardware watchdog keep-alive.
//!
//! Some SoCs arm the watchdog in ROM; the daemon must feed it or the board
//! resets in the middle of a flash. A dedicated thread pets it on a timer.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

nix::ioctl_read!(wdioc_keepalive, b'W', 5, i32);
nix::ioctl_readwrite!(wdioc_settimeout, b'W', 6, i32);

/// SoC ids whose boot ROM leaves the watchdog running (i.MX35, i.MX51, i.MX53).
pub const WATCHDOG_CPU_IDS: [i32; 3] = [35, 51, 53];

#[derive(Error, Debug)]
pub enum WatchdogError {
    #[error("Failed to open watchdog {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to start keep-alive thread: {0}")]
    Thread(#[source] io::Error),
}

/// Whether the board identified by `cpu_id` needs its watchdog fed.
pub fn needs_watchdog(cpu_id: i32) -> bool {
    WATCHDOG_CPU_IDS.contains(&cpu_id)
}

/// Running keep-alive thread. Dropping it stops the feeding.
pub struct Watchdog {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Open `device`, set its timeout and start feeding it every `interval`.
    pub fn start(
        device: &Path,
        timeout_secs: i32,
        interval: Duration,
    ) -> Result<Self, WatchdogError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .map_err(|source| WatchdogError::Open {
                path: device.to_path_buf(),
                source,
            })?;

        let mut timeout = timeout_secs;
        // SAFETY: `file` is open and `timeout` outlives the call.
        if let Err(e) = unsafe { wdioc_settimeout(file.as_raw_fd(), &mut timeout) } {
            warn!(error = %e, "Failed to set watchdog timeout");
        }
        info!(device = %device.display(), timeout, interval_secs = interval.as_secs(), "Watchdog armed");

        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                loop {
                    keepalive(&file);
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                debug!("Watchdog thread stopped");
            })
            .map_err(WatchdogError::Thread)?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stop feeding and join the thread.
    pub fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Watchdog thread panicked");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn keepalive(file: &File) {
    let mut dummy = 0;
    // SAFETY: `file` is open and `dummy` outlives the call.
    match unsafe { wdioc_keepalive(file.as_raw_fd(), &mut dummy) } {
        Ok(_) => debug!("Watchdog fed"),
        Err(e) => warn!(error = %e, "WDIOC_KEEPALIVE failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_policy() {
        assert!(needs_watchdog(35));
        assert!(needs_watchdog(51));
        assert!(needs_watchdog(53));
        for id in [23, 25, 28, 50, 0] {
            assert!(!needs_watchdog(id));
        }
    }

    #[test]
    fn test_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let err = Watchdog::start(&dir.path().join("watchdog"), 127, Duration::from_secs(60));
        assert!(matches!(err, Err(WatchdogError::Open { .. })));
    }

    #[test]
    fn test_thread_stops() {
        // A regular file rejects the ioctls; the thread logs and keeps going.
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut dog = Watchdog::start(file.path(), 127, Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(30));
        dog.stop();
        assert!(dog.handle.is_none());
    }
}
