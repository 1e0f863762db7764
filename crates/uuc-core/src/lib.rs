//! UUC-Core: device-side recovery and flashing engine.
//!
//! This crate serves the i.MX update protocol on the target board: it
//! receives commands from a host tool, runs them, bridges data into
//! external flashing programs and answers with framed replies.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Frames, UTP messages, commands and replies
//! - **Transport**: Host channel abstraction (UTP device, FunctionFS, mock)
//! - **Bridge**: Shell subprocess with threaded stdin/stdout pumps
//! - **Transfer**: Flow-controlled downloads and uploads
//! - **State**: Session object and command handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Daemon**: Command loop orchestrator and configuration
//! - **Watchdog / DevNode / BootStream**: Board support
//!
//! # Example
//!
//! ```no_run
//! use uuc_core::daemon::{Daemon, DaemonConfig};
//! use uuc_core::transport::FfsTransport;
//!
//! let config = DaemonConfig::default();
//! let transport = FfsTransport::open(&config.transport.ffs_ep0).expect("no gadget");
//! let mut daemon = Daemon::new(transport, config);
//! daemon.run().expect("host channel lost");
//! ```

pub mod bootstream;
pub mod bridge;
pub mod daemon;
pub mod devnode;
pub mod events;
pub mod protocol;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod watchdog;

// Re-exports for convenience
pub use bootstream::{BootStreamError, write_boot_stream};
pub use bridge::{Bridge, BridgeError, StdinMode};
pub use daemon::{Daemon, DaemonConfig, StepOutcome, TransportKind, WatchdogMode};
pub use events::{CommandPhase, LogLevel, TracingObserver, UucEvent, UucObserver};
pub use protocol::{Command, Reply};
pub use state::handlers::reboot_system;
pub use transfer::TransferError;
pub use transport::{FfsTransport, MockTransport, Transport, TransportError, UtpTransport};
pub use watchdog::Watchdog;
