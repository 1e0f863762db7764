//! Command handlers - dispatch logic for each host command.
//!
//! This module is split into submodules by functionality:
//! - `control`: Reboot and self-test
//! - `files`: Target files, downloads and uploads
//! - `flash`: Firmware finalization, partition pipes, device nodes
//! - `query`: Device descriptor and file reads
//! - `shell`: Shell runs, async pipes and sync points

mod control;
mod files;
mod flash;
mod query;
mod shell;

use std::io;

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::bootstream::BootStreamError;
use crate::bridge::BridgeError;
use crate::daemon::DaemonConfig;
use crate::devnode::DevNodeError;
use crate::events::{CommandPhase, LogLevel, UucEvent, UucObserver};
use crate::protocol::{Command, DETAIL_EPIPE, Reply, STATUS_FAILURE, STATUS_INVALID};
use crate::state::machine::SessionState;
use crate::transfer::TransferError;
use crate::transport::{Transport, TransportError};

pub use control::reboot_system;

/// Commands that get an early BUSY before the handler runs.
const BUSY_PREFIXES: [&str; 11] = [
    "$ ", "UCmd:", "pipe ", "ACmd:", "untar.", "wrf", "wrs", "frf", "frs", "Sync", "pollpipe",
];

/// Result of handling a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleResult {
    /// Terminal reply to send.
    Reply(Reply),
    /// Reboot requested; nothing is sent.
    Reboot,
}

impl From<Reply> for HandleResult {
    fn from(reply: Reply) -> Self {
        HandleResult::Reply(reply)
    }
}

/// Command text the dispatcher could not accept.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Unknown command: {0:?}")]
    Unknown(String),

    #[error("Bad argument for {command}: {argument:?}")]
    BadArgument {
        command: &'static str,
        argument: String,
    },
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, T: Transport + ?Sized> {
    pub transport: &'a mut T,
    pub observer: &'a dyn UucObserver,
    pub state: &'a mut SessionState,
    pub config: &'a DaemonConfig,
}

impl<T: Transport + ?Sized> HandlerContext<'_, T> {
    pub(crate) fn emit(&self, event: UucEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(UucEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn goto_phase(&mut self, to: CommandPhase) {
        let from = self.state.goto_phase(to);
        if from != to {
            self.emit(UucEvent::PhaseChanged { from, to });
        }
    }

    /// `FILE=<target file>` for every spawned shell.
    pub(crate) fn shell_env(&self) -> String {
        self.config.target_file.display().to_string()
    }
}

/// Whether `text` names a long-running command.
pub fn is_busy_command(text: &str) -> bool {
    BUSY_PREFIXES.iter().any(|p| text.starts_with(p))
}

/// Run one command through its full cycle and send the terminal reply.
///
/// Handler errors become FAIL replies here; only fatal transport errors
/// are returned.
pub fn handle_command<T: Transport + ?Sized>(
    command: &Command,
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    ctx.emit(UucEvent::CommandReceived {
        text: command.text.clone(),
        argument: command.argument,
    });
    ctx.goto_phase(CommandPhase::Received);

    if is_busy_command(&command.text) {
        ctx.transport.send(&Reply::Busy)?;
        ctx.goto_phase(CommandPhase::BusySent);
    }

    ctx.goto_phase(CommandPhase::HandlerRunning);
    let result = match dispatch(command, ctx) {
        Ok(result) => result,
        Err(e) => {
            if let Some(fatal) = fatal_transport_error(&e) {
                error!(command = %command.text, error = %fatal, "Host channel lost");
                ctx.goto_phase(CommandPhase::Idle);
                return Err(e);
            }
            let reply = error_reply(&e);
            warn!(command = %command.text, status = reply.status(), "Command failed: {:#}", e);
            ctx.emit(UucEvent::Error {
                status: reply.status(),
                message: format!("{:#}", e),
            });
            HandleResult::Reply(reply)
        }
    };

    if let HandleResult::Reply(reply) = &result {
        send_terminal(ctx, reply)?;
        ctx.goto_phase(CommandPhase::ReplySent);
    }
    ctx.goto_phase(CommandPhase::Idle);
    Ok(result)
}

/// Send the terminal reply. If the transport cannot render it, fall back
/// to a plain FAIL so the host is not left waiting.
fn send_terminal<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    reply: &Reply,
) -> Result<()> {
    match ctx.transport.send(reply) {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e.into()),
        Err(e) => {
            warn!(error = %e, kind = reply.kind(), "Reply not sent, reporting failure");
            if let Err(e) = ctx.transport.send(&Reply::fail(STATUS_FAILURE))
                && e.is_fatal()
            {
                return Err(e.into());
            }
            Ok(())
        }
    }
}

/// Look up the handler for `command` and run it.
fn dispatch<T: Transport + ?Sized>(
    command: &Command,
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    let text = command.text.as_str();
    debug!(command = %text, argument = command.argument, "Dispatching");

    // Exact matches first (`pollpipe` before the `pipe ` prefix family).
    match text {
        "?" => return query::handle_query(ctx),
        "selftest" => return control::handle_selftest(ctx),
        "pollpipe" => return shell::handle_pollpipe(ctx),
        "frf" | "frs" | "Sync" => return shell::handle_sync(ctx),
        "wff" | "wfs" | "send" => return files::handle_open_firmware(ctx),
        "fff" => return flash::handle_fff(ctx),
        "ffs" => return flash::handle_ffs(ctx),
        "upload" => return files::handle_upload(ctx),
        "Close" => return files::handle_close(ctx),
        _ => {}
    }

    if let Some(code) = text.strip_prefix('!') {
        return control::handle_bang(ctx, code);
    }
    if let Some(sh) = text.strip_prefix("$ ").or_else(|| text.strip_prefix("UCmd:")) {
        return shell::handle_run(ctx, sh);
    }
    if let Some(sh) = text.strip_prefix("pipe ").or_else(|| text.strip_prefix("ACmd:")) {
        return shell::handle_pipe(ctx, sh);
    }
    if let Some(rest) = text.strip_prefix("untar.") {
        return flash::handle_untar(ctx, rest);
    }
    if let Some(index) = text.strip_prefix("wrf") {
        return flash::handle_wrf(ctx, index, command.argument);
    }
    if let Some(index) = text.strip_prefix("wrs") {
        return flash::handle_wrs(ctx, index, command.argument);
    }
    if let Some(args) = text.strip_prefix("mknod ") {
        return flash::handle_mknod(ctx, args);
    }
    if let Some(path) = text.strip_prefix("save ") {
        return files::handle_save(ctx, path);
    }
    if let Some(path) = text.strip_prefix("read ") {
        return query::handle_read(ctx, path);
    }
    if let Some(path) = text.strip_prefix("WOpen:") {
        return files::handle_wopen(ctx, path);
    }
    if let Some(path) = text.strip_prefix("ROpen:") {
        return files::handle_ropen(ctx, path);
    }
    if let Some(size) = text
        .strip_prefix("download:")
        .or_else(|| text.strip_prefix("donwload:"))
    {
        return files::handle_download(ctx, size);
    }

    warn!(command = %text, "Unhandled command");
    ctx.log(LogLevel::Warn, format!("Unhandled command: {}", text));
    Err(CommandError::Unknown(text.to_string()).into())
}

/// First fatal transport error in the chain, if any.
fn fatal_transport_error(e: &anyhow::Error) -> Option<&TransportError> {
    e.chain().find_map(|cause| {
        let transport = cause.downcast_ref::<TransportError>().or_else(|| {
            match cause.downcast_ref::<TransferError>() {
                Some(TransferError::Transport(t)) => Some(t),
                _ => None,
            }
        })?;
        transport.is_fatal().then_some(transport)
    })
}

/// Convert a handler error into the FAIL reply the host sees.
fn error_reply(e: &anyhow::Error) -> Reply {
    for cause in e.chain() {
        if let Some(err) = cause.downcast_ref::<TransferError>() {
            return Reply::fail_with(err.status(), err.detail());
        }
        if let Some(err) = cause.downcast_ref::<BridgeError>() {
            return match err {
                BridgeError::BrokenPipe => Reply::fail_with(err.status(), DETAIL_EPIPE),
                _ => Reply::fail(err.status()),
            };
        }
        if let Some(err) = cause.downcast_ref::<DevNodeError>() {
            return Reply::fail(err.status());
        }
        if let Some(err) = cause.downcast_ref::<BootStreamError>() {
            return Reply::fail(err.status());
        }
        if cause.downcast_ref::<CommandError>().is_some() {
            return Reply::fail(STATUS_INVALID);
        }
        if let Some(TransportError::Unsupported { .. }) = cause.downcast_ref::<TransportError>() {
            return Reply::fail(STATUS_INVALID);
        }
        if let Some(err) = cause.downcast_ref::<io::Error>() {
            return Reply::fail(err.raw_os_error().map_or(STATUS_FAILURE, |errno| -errno));
        }
    }
    Reply::fail(STATUS_FAILURE)
}
