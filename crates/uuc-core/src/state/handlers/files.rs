//! Target files, downloads and uploads.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::bridge::BridgeError;
use crate::protocol::{Reply, UPLOAD_CHUNK};
use crate::state::machine::Target;
use crate::transfer::{self, TransferError};
use crate::transport::Transport;

use super::{CommandError, HandleResult, HandlerContext};

/// `wff`, `wfs`, `send` - start a fresh firmware staging file.
pub fn handle_open_firmware<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    let path = &ctx.config.target_file;
    ctx.state.close_target();
    let file = open_for_write(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    ctx.state.set_write_file(file, path);
    ctx.state.transfer = None;
    info!(path = %path.display(), "Firmware target opened");
    Ok(Reply::okay().into())
}

/// `save <path>` - close the staging file and move it into place.
pub fn handle_save<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    dest: &str,
) -> Result<HandleResult> {
    let dest = dest.trim();
    ctx.state.close_target();
    fs::rename(&ctx.config.target_file, dest)
        .with_context(|| format!("Failed to save firmware as {}", dest))?;
    info!(dest, "Firmware saved");
    Ok(Reply::okay().into())
}

/// `WOpen:<path>` / `WOpen:-`.
pub fn handle_wopen<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    path: &str,
) -> Result<HandleResult> {
    let path = path.trim();
    if path == "-" {
        if !ctx.state.bridge().is_some_and(|b| b.has_stdin()) {
            return Err(BridgeError::NoStdin.into());
        }
        ctx.state.target = Some(Target::BridgeStdin);
        return Ok(Reply::okay().into());
    }

    let path = Path::new(path);
    if path.is_dir() {
        return Err(TransferError::Directory.into());
    }
    let file = open_for_write(path).map_err(TransferError::Io)?;
    ctx.state.close_target();
    ctx.state.set_write_file(file, path);
    info!(path = %path.display(), "Write target opened");
    Ok(Reply::okay().into())
}

/// `ROpen:<path>` / `ROpen:-` - reply with the size as 16 hex digits.
pub fn handle_ropen<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    path: &str,
) -> Result<HandleResult> {
    let path = path.trim();
    if path == "-" {
        if ctx.state.bridge().is_none() {
            return Err(TransferError::NoTarget("ROpen").into());
        }
        ctx.state.target = Some(Target::BridgeStdout);
        return Ok(Reply::okay().into());
    }

    let path = Path::new(path);
    if path.is_dir() {
        return Err(TransferError::Directory.into());
    }
    let file = File::open(path).map_err(TransferError::Io)?;
    let size = file.metadata().map_err(TransferError::Io)?.len();
    ctx.state.close_target();
    ctx.state.target = Some(Target::Reader {
        file,
        path: path.to_path_buf(),
    });
    info!(path = %path.display(), size, "Read target opened");
    Ok(Reply::Okay(format!("{:016X}", size).into_bytes()).into())
}

/// `Close`.
pub fn handle_close<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    ctx.state.close_target();
    Ok(Reply::okay().into())
}

/// `download:<hex>`.
pub fn handle_download<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    size: &str,
) -> Result<HandleResult> {
    let declared = u32::from_str_radix(size.trim(), 16).map_err(|_| CommandError::BadArgument {
        command: "download",
        argument: size.to_string(),
    })?;
    transfer::download(&mut *ctx.transport, ctx.state, ctx.observer, declared)?;
    Ok(Reply::okay().into())
}

/// `upload`.
pub fn handle_upload<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    let reply = transfer::upload(&mut *ctx.transport, ctx.state, UPLOAD_CHUNK)?;
    Ok(reply.into())
}

fn open_for_write(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(path)
}
