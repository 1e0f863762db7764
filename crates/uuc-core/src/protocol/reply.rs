//! Transport-neutral replies produced by command handlers.

use std::fmt;

use super::constants::STATUS_FAILURE;

/// A reply as handlers see it. Each transport renders it into its own
/// framing (see `transport::ffs` and `transport::utp`).
#[derive(Clone, PartialEq, Eq)]
pub enum Reply {
    /// Progress text or subprocess output.
    Info(Vec<u8>),
    /// Early heartbeat before a long-running handler.
    Busy,
    /// Announces `len` raw bytes that follow via `write_bulk`.
    DataHeader(u32),
    /// Terminal success with an optional payload.
    Okay(Vec<u8>),
    /// Terminal failure with a status code and a short detail marker.
    Fail { status: i32, detail: Vec<u8> },
    /// Terminal data reply.
    Data(Vec<u8>),
}

impl Reply {
    pub fn okay() -> Self {
        Reply::Okay(Vec::new())
    }

    pub fn fail(status: i32) -> Self {
        Reply::Fail {
            status,
            detail: Vec::new(),
        }
    }

    pub fn fail_with(status: i32, detail: &[u8]) -> Self {
        Reply::Fail {
            status,
            detail: detail.to_vec(),
        }
    }

    /// OKAY for exit code 0, FAIL carrying the code otherwise.
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            Self::okay()
        } else {
            Self::fail(code)
        }
    }

    /// Heartbeat with no text.
    pub fn heartbeat() -> Self {
        Reply::Info(Vec::new())
    }

    /// Whether this reply ends the command cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Reply::Okay(_) | Reply::Fail { .. } | Reply::Data(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Okay(_) | Reply::Data(_))
    }

    /// Status code carried by a failure; 0 for everything else.
    pub fn status(&self) -> i32 {
        match self {
            Reply::Fail { status, .. } if *status != 0 => *status,
            Reply::Fail { .. } => STATUS_FAILURE,
            _ => 0,
        }
    }

    /// Short name used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Info(_) => "INFO",
            Reply::Busy => "BUSY",
            Reply::DataHeader(_) => "DATA-HEADER",
            Reply::Okay(_) => "OKAY",
            Reply::Fail { .. } => "FAIL",
            Reply::Data(_) => "DATA",
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Info(text) => write!(f, "Info({:?})", String::from_utf8_lossy(text)),
            Reply::Busy => write!(f, "Busy"),
            Reply::DataHeader(len) => write!(f, "DataHeader({len:#x})"),
            Reply::Okay(text) => write!(f, "Okay({:?})", String::from_utf8_lossy(text)),
            Reply::Fail { status, detail } => write!(
                f,
                "Fail({status}, {:?})",
                String::from_utf8_lossy(detail)
            ),
            Reply::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
        }
    }
}
