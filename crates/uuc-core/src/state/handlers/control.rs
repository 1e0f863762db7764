//! Control flow handlers (reboot, self-test).

use std::thread;
use std::time::Duration;

use anyhow::Result;
use nix::sys::reboot::{RebootMode, reboot};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, sync};
use tracing::{info, warn};

use crate::events::LogLevel;
use crate::protocol::Reply;
use crate::transport::Transport;

use super::{HandleResult, HandlerContext};

/// `!<n>` - `!3` reboots without a reply; any other code is acknowledged.
pub fn handle_bang<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    code: &str,
) -> Result<HandleResult> {
    if code == "3" {
        info!("Reboot requested by host");
        ctx.log(LogLevel::Info, "Rebooting");
        return Ok(HandleResult::Reboot);
    }
    info!(code, "Ignoring control code");
    Ok(Reply::okay().into())
}

/// `selftest`.
pub fn handle_selftest<T: Transport + ?Sized>(
    _ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    Ok(Reply::okay().into())
}

/// Stop every process, flush filesystems and restart the board.
///
/// Only returns on failure.
pub fn reboot_system(grace: Duration) -> Result<()> {
    sync();
    let all = Pid::from_raw(-1);
    if let Err(e) = kill(all, Signal::SIGTERM) {
        warn!(error = %e, "SIGTERM broadcast failed");
    }
    thread::sleep(grace);
    if let Err(e) = kill(all, Signal::SIGKILL) {
        warn!(error = %e, "SIGKILL broadcast failed");
    }
    sync();
    info!("Restarting");
    match reboot(RebootMode::RB_AUTOBOOT) {
        Ok(never) => match never {},
        Err(e) => Err(e.into()),
    }
}
