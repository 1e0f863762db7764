//! Event system for UI decoupling.
//!
//! Lets the CLI (or anything embedding the engine) follow the daemon's
//! progress without the engine knowing how it is displayed.

use std::fmt;
use std::sync::Mutex;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Phases of one command/reply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandPhase {
    /// Waiting for the next command.
    #[default]
    Idle,
    /// Command decoded, not yet dispatched.
    Received,
    /// Early BUSY heartbeat sent.
    BusySent,
    /// Handler is running.
    HandlerRunning,
    /// Terminal reply sent.
    ReplySent,
}

impl fmt::Display for CommandPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandPhase::Idle => write!(f, "Idle"),
            CommandPhase::Received => write!(f, "Received"),
            CommandPhase::BusySent => write!(f, "Busy Sent"),
            CommandPhase::HandlerRunning => write!(f, "Handler Running"),
            CommandPhase::ReplySent => write!(f, "Reply Sent"),
        }
    }
}

/// Events emitted by the daemon.
#[derive(Debug, Clone)]
pub enum UucEvent {
    /// Host channel is ready.
    TransportReady { transport: &'static str },
    /// Command received from the host.
    CommandReceived { text: String, argument: u64 },
    /// Phase changed.
    PhaseChanged {
        from: CommandPhase,
        to: CommandPhase,
    },
    /// Progress of a bulk transfer.
    Progress {
        operation: &'static str,
        current: u64,
        total: u64,
    },
    /// Subprocess started.
    ProcessSpawned { pid: u32, command: String },
    /// Subprocess reaped.
    ProcessExited { pid: u32, code: i32 },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Command failed; the host sees `status`.
    Error { status: i32, message: String },
    /// Reply or raw data sent, or data received.
    Packet {
        direction: PacketDirection,
        kind: &'static str,
        length: usize,
    },
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Device -> Host
    Rx, // Host -> Device
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving daemon events.
pub trait UucObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UucEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UucObserver for NullObserver {
    fn on_event(&self, _event: &UucEvent) {}
}

/// Observer that keeps every event, for tests and post-mortem dumps.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<UucEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<UucEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl UucObserver for RecordingObserver {
    fn on_event(&self, event: &UucEvent) {
        let mut events = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        events.push(event.clone());
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UucObserver for TracingObserver {
    fn on_event(&self, event: &UucEvent) {
        match event {
            UucEvent::TransportReady { transport } => {
                tracing::info!(transport = %transport, "Host channel ready");
            }
            UucEvent::CommandReceived { text, argument } => {
                tracing::info!(command = %text, argument, "Received command");
            }
            UucEvent::PhaseChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Phase changed");
            }
            UucEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    100
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            UucEvent::ProcessSpawned { pid, command } => {
                tracing::info!(pid, command = %command, "Subprocess spawned");
            }
            UucEvent::ProcessExited { pid, code } => {
                tracing::info!(pid, code, "Subprocess exited");
            }
            UucEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            UucEvent::Error { status, message } => {
                tracing::error!(status, "Command failed: {}", message);
            }
            UucEvent::Packet {
                direction,
                kind,
                length,
            } => {
                tracing::trace!(dir = %direction, kind = %kind, len = length, "Packet");
            }
        }
    }
}
