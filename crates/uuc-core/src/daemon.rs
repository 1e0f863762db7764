//! Daemon - command loop orchestrator and its configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::events::{PacketDirection, TracingObserver, UucEvent, UucObserver};
use crate::protocol::{DEFAULT_FFS_EP0, DEFAULT_TARGET_FILE, Reply, UTP_DEVNODE};
use crate::state::handlers::{HandleResult, HandlerContext, handle_command};
use crate::state::machine::SessionState;
use crate::transfer;
use crate::transport::{Inbound, Transport, TransportError};

/// Which host channel to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `/dev/utp` message device.
    #[default]
    Utp,
    /// FunctionFS bulk endpoints.
    Ffs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// UTP device node, created from sysfs when missing.
    pub utp_device: PathBuf,
    /// FunctionFS control endpoint; `ep1`/`ep2` live next to it.
    pub ffs_ep0: PathBuf,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Utp,
            utp_device: PathBuf::from(UTP_DEVNODE),
            ffs_ep0: PathBuf::from(DEFAULT_FFS_EP0),
        }
    }
}

/// Values reported by the `?` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub firmware: String,
    pub serial: String,
    pub chip_id: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            firmware: "2.6.31".to_string(),
            serial: "000000000000".to_string(),
            chip_id: "370000A5".to_string(),
            vendor_id: 0x066F,
            product_id: 0x37FF,
        }
    }
}

/// External programs driven by the flashing commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ubiformat: String,
    pub kobs_ng: String,
    pub fdisk: String,
    pub dd: String,
    pub tar: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ubiformat: "ubiformat".to_string(),
            kobs_ng: "kobs-ng".to_string(),
            fdisk: "fdisk".to_string(),
            dd: "dd".to_string(),
            tar: "tar".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Bounded wait for subprocess output between heartbeats.
    pub output_poll_ms: u64,
    /// Grace period before checking whether an async child died at once.
    pub pipe_settle_ms: u64,
    /// Upper bound for `pollpipe`.
    pub pollpipe_timeout_secs: u64,
    pub pollpipe_interval_ms: u64,
    /// Wait for the kernel to rescan partitions after fdisk.
    pub partition_settle_secs: u64,
    /// Between TERM and KILL on reboot.
    pub reboot_grace_secs: u64,
    /// Retry period while waiting for the UTP device.
    pub device_retry_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            output_poll_ms: 50,
            pipe_settle_ms: 50,
            pollpipe_timeout_secs: 655,
            pollpipe_interval_ms: 10,
            partition_settle_secs: 5,
            reboot_grace_secs: 1,
            device_retry_ms: 1000,
        }
    }
}

impl TimingConfig {
    pub fn output_poll(&self) -> Duration {
        Duration::from_millis(self.output_poll_ms)
    }

    pub fn pipe_settle(&self) -> Duration {
        Duration::from_millis(self.pipe_settle_ms)
    }

    pub fn pollpipe_timeout(&self) -> Duration {
        Duration::from_secs(self.pollpipe_timeout_secs)
    }

    pub fn pollpipe_interval(&self) -> Duration {
        Duration::from_millis(self.pollpipe_interval_ms)
    }

    pub fn partition_settle(&self) -> Duration {
        Duration::from_secs(self.partition_settle_secs)
    }

    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }

    pub fn device_retry(&self) -> Duration {
        Duration::from_millis(self.device_retry_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogMode {
    /// Decide from the SoC id.
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub mode: WatchdogMode,
    pub device: PathBuf,
    pub timeout_secs: i32,
    pub interval_secs: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            mode: WatchdogMode::Auto,
            device: PathBuf::from("/dev/watchdog"),
            timeout_secs: 127,
            interval_secs: 60,
        }
    }
}

impl WatchdogConfig {
    /// Whether to start the keep-alive thread for `cpu_id` (if known).
    pub fn enabled_for(&self, cpu_id: Option<i32>) -> bool {
        match self.mode {
            WatchdogMode::On => true,
            WatchdogMode::Off => false,
            WatchdogMode::Auto => cpu_id.is_some_and(crate::watchdog::needs_watchdog),
        }
    }
}

/// Configuration for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub transport: TransportConfig,
    /// Where device nodes are created.
    pub dev_root: PathBuf,
    /// Where `<class>/<name>/dev` files are looked up.
    pub sys_root: PathBuf,
    /// Firmware staging file written by `wff`/`wfs`/`send`.
    pub target_file: PathBuf,
    pub identity: IdentityConfig,
    pub tools: ToolsConfig,
    pub timing: TimingConfig,
    pub watchdog: WatchdogConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            dev_root: PathBuf::from("/dev"),
            sys_root: PathBuf::from("/sys"),
            target_file: PathBuf::from(DEFAULT_TARGET_FILE),
            identity: IdentityConfig::default(),
            tools: ToolsConfig::default(),
            timing: TimingConfig::default(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Device node path under `dev_root`.
    pub fn dev_path(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }
}

/// What the loop should do after one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// The host asked for a reboot; the caller performs it.
    Reboot,
}

/// Back-off after a transient receive error.
const RECEIVE_RETRY: Duration = Duration::from_millis(50);

/// Daemon - serves commands from one host channel.
pub struct Daemon<T: Transport, O: UucObserver> {
    transport: T,
    config: DaemonConfig,
    observer: Arc<O>,
    state: SessionState,
}

impl<T: Transport> Daemon<T, TracingObserver> {
    /// Create a daemon with the default tracing observer.
    pub fn new(transport: T, config: DaemonConfig) -> Self {
        Self::with_observer(transport, config, Arc::new(TracingObserver))
    }
}

impl<T: Transport, O: UucObserver> Daemon<T, O> {
    /// Create a daemon with a custom observer.
    pub fn with_observer(transport: T, config: DaemonConfig, observer: Arc<O>) -> Self {
        Self {
            transport,
            config,
            observer,
            state: SessionState::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Serve commands until the host asks for a reboot.
    ///
    /// Returns `Ok(())` when a reboot was requested; fatal transport errors
    /// end the loop with an error.
    #[instrument(skip(self), fields(transport = self.transport.name()))]
    pub fn run(&mut self) -> Result<()> {
        self.observer.on_event(&UucEvent::TransportReady {
            transport: self.transport.name(),
        });
        info!("Serving commands");

        loop {
            match self.step()? {
                StepOutcome::Continue => {}
                StepOutcome::Reboot => {
                    info!("Reboot requested");
                    return Ok(());
                }
            }
        }
    }

    /// Receive and handle one inbound item.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let mut transport = ObservableTransport {
            inner: &mut self.transport,
            observer: self.observer.as_ref(),
        };

        let inbound = match transport.receive() {
            Ok(inbound) => inbound,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Transient receive error, retrying");
                thread::sleep(RECEIVE_RETRY);
                return Ok(StepOutcome::Continue);
            }
            Err(e) => return Err(e.into()),
        };

        match inbound {
            Inbound::Command(command) => {
                let mut ctx = HandlerContext {
                    transport: &mut transport,
                    observer: self.observer.as_ref(),
                    state: &mut self.state,
                    config: &self.config,
                };
                match handle_command(&command, &mut ctx)? {
                    HandleResult::Reply(_) => Ok(StepOutcome::Continue),
                    HandleResult::Reboot => Ok(StepOutcome::Reboot),
                }
            }
            Inbound::Data(bytes) => {
                // Failures surface at the next sync.
                if let Err(e) = transfer::append_data(&mut self.state, &bytes) {
                    warn!(error = %e, len = bytes.len(), "Streaming write failed");
                }
                Ok(StepOutcome::Continue)
            }
            Inbound::Idle => Ok(StepOutcome::Continue),
        }
    }
}

/// Transport wrapper that emits packet events.
struct ObservableTransport<'a, T: Transport, O: UucObserver> {
    inner: &'a mut T,
    observer: &'a O,
}

impl<T: Transport, O: UucObserver> ObservableTransport<'_, T, O> {
    fn packet(&self, direction: PacketDirection, kind: &'static str, length: usize) {
        self.observer.on_event(&UucEvent::Packet {
            direction,
            kind,
            length,
        });
    }
}

impl<T: Transport, O: UucObserver> Transport for ObservableTransport<'_, T, O> {
    fn receive(&mut self) -> Result<Inbound, TransportError> {
        let res = self.inner.receive();
        match &res {
            Ok(Inbound::Command(cmd)) => self.packet(PacketDirection::Rx, "CMD", cmd.text.len()),
            Ok(Inbound::Data(data)) => self.packet(PacketDirection::Rx, "DATA", data.len()),
            _ => {}
        }
        res
    }

    fn send(&mut self, reply: &Reply) -> Result<(), TransportError> {
        let res = self.inner.send(reply);
        if res.is_ok() {
            let length = match reply {
                Reply::Info(b) | Reply::Okay(b) | Reply::Data(b) => b.len(),
                Reply::Fail { detail, .. } => detail.len(),
                Reply::DataHeader(n) => *n as usize,
                Reply::Busy => 0,
            };
            self.packet(PacketDirection::Tx, reply.kind(), length);
        }
        res
    }

    fn read_bulk(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read_bulk(max_len);
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.packet(PacketDirection::Rx, "BULK", data.len());
        }
        res
    }

    fn write_bulk(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write_bulk(data);
        if res.is_ok() {
            self.packet(PacketDirection::Tx, "BULK", data.len());
        }
        res
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::events::RecordingObserver;
    use crate::protocol::STATUS_INVALID;
    use crate::transport::MockTransport;

    fn test_config(dir: &Path) -> DaemonConfig {
        DaemonConfig {
            target_file: dir.join("file.utp"),
            dev_root: dir.join("dev"),
            sys_root: dir.join("sys"),
            timing: TimingConfig {
                output_poll_ms: 10,
                pipe_settle_ms: 20,
                pollpipe_timeout_secs: 5,
                partition_settle_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn daemon(
        mock: &MockTransport,
        config: DaemonConfig,
    ) -> (Daemon<MockTransport, RecordingObserver>, Arc<RecordingObserver>) {
        let observer = Arc::new(RecordingObserver::default());
        (
            Daemon::with_observer(mock.clone(), config, observer.clone()),
            observer,
        )
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("uuc.toml");
        let mut config = DaemonConfig::default();
        config.transport.kind = TransportKind::Ffs;
        config.watchdog.mode = WatchdogMode::Off;
        config.save_to_file(&path).unwrap();

        let loaded = DaemonConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: DaemonConfig = toml::from_str(
            "target_file = \"/data/fw.bin\"\n[transport]\nkind = \"ffs\"\n",
        )
        .unwrap();
        assert_eq!(config.transport.kind, TransportKind::Ffs);
        assert_eq!(config.transport.ffs_ep0, PathBuf::from(DEFAULT_FFS_EP0));
        assert_eq!(config.target_file, PathBuf::from("/data/fw.bin"));
        assert_eq!(config.identity.vendor_id, 0x066F);
    }

    #[test]
    fn test_watchdog_policy() {
        let mut wd = WatchdogConfig::default();
        assert!(wd.enabled_for(Some(51)));
        assert!(!wd.enabled_for(Some(25)));
        assert!(!wd.enabled_for(None));
        wd.mode = WatchdogMode::On;
        assert!(wd.enabled_for(None));
        wd.mode = WatchdogMode::Off;
        assert!(!wd.enabled_for(Some(53)));
    }

    #[test]
    fn test_unknown_command_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.queue_command("bogus");
        mock.queue_command("selftest");
        let (mut d, _) = daemon(&mock, test_config(dir.path()));

        assert_eq!(d.step().unwrap(), StepOutcome::Continue);
        assert_eq!(d.step().unwrap(), StepOutcome::Continue);
        assert_eq!(
            mock.terminal_replies(),
            vec![Reply::fail(STATUS_INVALID), Reply::okay()]
        );
    }

    #[test]
    fn test_run_ends_on_reboot() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.queue_command("!1");
        mock.queue_command("!3");
        let (mut d, observer) = daemon(&mock, test_config(dir.path()));

        d.run().unwrap();
        // `!3` sends nothing.
        assert_eq!(mock.terminal_replies(), vec![Reply::okay()]);
        assert!(matches!(
            observer.events().first(),
            Some(UucEvent::TransportReady { transport: "mock" })
        ));
    }

    #[test]
    fn test_run_fails_when_channel_dies() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.queue_command("selftest");
        let (mut d, _) = daemon(&mock, test_config(dir.path()));

        // The mock reports a fatal read error once its queue is empty.
        assert!(d.run().is_err());
        assert_eq!(mock.terminal_replies(), vec![Reply::okay()]);
    }

    #[test]
    fn test_streaming_data_and_sync() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let target = config.target_file.clone();
        let mock = MockTransport::new();
        mock.queue_command("wff");
        mock.queue_data(b"abc");
        mock.queue_data(b"def");
        mock.queue_command("Sync");
        let (mut d, _) = daemon(&mock, config);

        for _ in 0..4 {
            d.step().unwrap();
        }
        assert_eq!(mock.terminal_replies(), vec![Reply::okay(), Reply::okay()]);
        // Data messages get no reply of their own.
        assert_eq!(mock.replies().len(), 3);
        assert_eq!(fs::read(target).unwrap(), b"abcdef");
    }

    #[test]
    fn test_packet_events() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockTransport::new();
        mock.queue_command("?");
        let (mut d, observer) = daemon(&mock, test_config(dir.path()));
        d.step().unwrap();

        let packets: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                UucEvent::Packet {
                    direction, kind, ..
                } => Some((direction, kind)),
                _ => None,
            })
            .collect();
        assert_eq!(
            packets,
            vec![(PacketDirection::Rx, "CMD"), (PacketDirection::Tx, "DATA")]
        );
    }
}
