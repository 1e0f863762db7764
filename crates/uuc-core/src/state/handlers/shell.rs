//! Shell runs, async pipes and sync points.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{info, warn};

use crate::bridge::{BridgeError, ProcessState, StdinMode};
use crate::events::UucEvent;
use crate::protocol::Reply;
use crate::state::machine::{Target, TransferSession};
use crate::transfer;
use crate::transport::Transport;

use super::{HandleResult, HandlerContext};

/// Minimum spacing of heartbeats while `pollpipe` waits.
const POLL_HEARTBEAT: Duration = Duration::from_secs(1);

/// `$ <sh>` / `UCmd:<sh>` - run and wait, streaming output as INFO.
pub fn handle_run<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    command: &str,
) -> Result<HandleResult> {
    let code = run_to_completion(ctx, command, None)?;
    Ok(Reply::from_exit_code(code).into())
}

/// `pipe <sh>` / `ACmd:<sh>` - start a child whose stdin takes downloads.
pub fn handle_pipe<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    command: &str,
) -> Result<HandleResult> {
    start_pipe(ctx, command, None)
}

/// `frf`, `frs`, `Sync` - close the pipe, forward its output, reap it.
pub fn handle_sync<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    if ctx.state.bridge().is_none() {
        transfer::finish_stream(ctx.state)?;
        return Ok(Reply::okay().into());
    }

    let streamed = feed_and_stream(ctx, None);
    reap(ctx);
    let stream = transfer::finish_stream(ctx.state);

    let code = streamed?;
    if code != 0 {
        return Ok(Reply::from_exit_code(code).into());
    }
    stream?;
    Ok(Reply::okay().into())
}

/// `pollpipe` - wait (bounded) for the piped child to exit on its own,
/// forwarding its output as INFO.
pub fn handle_pollpipe<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    let timing = &ctx.config.timing;
    let (timeout, interval) = (timing.pollpipe_timeout(), timing.pollpipe_interval());

    let transport = &mut *ctx.transport;
    let Some(bridge) = ctx.state.bridge_mut() else {
        return Ok(Reply::okay().into());
    };
    let mut last_beat = Instant::now();
    let exited = bridge.stream_for(timeout, interval, |chunk| {
        if chunk.is_empty() && last_beat.elapsed() < POLL_HEARTBEAT {
            return Ok(());
        }
        last_beat = Instant::now();
        transport.send(&Reply::Info(chunk))?;
        Ok::<(), anyhow::Error>(())
    })?;

    match exited {
        Some(code) => {
            reap(ctx);
            Ok(Reply::from_exit_code(code).into())
        }
        None => {
            warn!(timeout_secs = timeout.as_secs(), "Subprocess still running");
            Ok(Reply::fail(1).into())
        }
    }
}

/// Spawn `command` as the async pipe and make its stdin the write target.
///
/// `declared` starts a streaming transfer checked at the next sync.
pub(super) fn start_pipe<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    command: &str,
    declared: Option<u64>,
) -> Result<HandleResult> {
    ctx.state.ensure_slot_free()?;
    ctx.state.close_target();

    let file = ctx.shell_env();
    let pid = ctx
        .state
        .spawn_bridge(command, StdinMode::Piped, &[("FILE", file.as_str())])?
        .pid();
    ctx.emit(UucEvent::ProcessSpawned {
        pid,
        command: command.to_string(),
    });
    ctx.state.target = Some(Target::BridgeStdin);
    ctx.state.transfer = declared.map(TransferSession::new);

    thread::sleep(ctx.config.timing.pipe_settle());
    let state = match ctx.state.bridge_mut() {
        Some(bridge) => bridge.poll()?,
        None => ProcessState::Running,
    };
    if let ProcessState::Exited(code) = state
        && code != 0
    {
        warn!(pid, code, "Piped command exited immediately");
        reap(ctx);
        ctx.state.transfer = None;
        return Ok(Reply::from_exit_code(code).into());
    }
    Ok(Reply::okay().into())
}

/// Run `command` in the slot, feed it `input`, forward output until exit.
pub(super) fn run_to_completion<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    command: &str,
    input: Option<&[u8]>,
) -> Result<i32> {
    let file = ctx.shell_env();
    let stdin = if input.is_some() {
        StdinMode::Piped
    } else {
        StdinMode::Null
    };
    let pid = ctx
        .state
        .spawn_bridge(command, stdin, &[("FILE", file.as_str())])?
        .pid();
    ctx.emit(UucEvent::ProcessSpawned {
        pid,
        command: command.to_string(),
    });

    let streamed = feed_and_stream(ctx, input);
    let reaped = reap(ctx);
    let code = streamed?;
    Ok(reaped.unwrap_or(code))
}

/// Feed `input`, close stdin and forward output until the child exits.
fn feed_and_stream<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    input: Option<&[u8]>,
) -> Result<i32> {
    let wait = ctx.config.timing.output_poll();
    let transport = &mut *ctx.transport;
    let bridge = ctx.state.bridge_mut().ok_or(BridgeError::NoStdin)?;

    if let Some(input) = input {
        bridge.write_stdin(input, |chunk| {
            transport.send(&Reply::Info(chunk))?;
            Ok::<(), anyhow::Error>(())
        })?;
    }
    bridge.close_stdin();
    bridge.stream_until_exit(wait, |chunk| {
        transport.send(&Reply::Info(chunk))?;
        Ok::<(), anyhow::Error>(())
    })
}

/// Take the child out of the slot and reap it.
fn reap<T: Transport + ?Sized>(ctx: &mut HandlerContext<'_, T>) -> Option<i32> {
    let mut bridge = ctx.state.take_bridge()?;
    let pid = bridge.pid();
    match bridge.wait() {
        Ok(code) => {
            info!(pid, code, command = bridge.command(), "Subprocess reaped");
            ctx.emit(UucEvent::ProcessExited { pid, code });
            Some(code)
        }
        Err(e) => {
            warn!(pid, error = %e, "Failed to reap subprocess");
            None
        }
    }
}
