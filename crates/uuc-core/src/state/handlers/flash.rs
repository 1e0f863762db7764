//! Firmware finalization, partition pipes and device nodes.

use std::thread;

use anyhow::Result;
use tracing::{info, warn};

use crate::devnode::{self, MknodRequest, NodeKind};
use crate::protocol::Reply;
use crate::transport::Transport;

use super::shell::{run_to_completion, start_pipe};
use super::{CommandError, HandleResult, HandlerContext};

/// Partitions deleted before the SD card is re-laid out.
const FDISK_DELETE: [u32; 4] = [4, 3, 2, 1];

/// fdisk input: wipe the table, a 16 MiB boot partition of type 0x53,
/// the rest as a second partition.
fn fdisk_script() -> String {
    let mut script = String::new();
    for part in FDISK_DELETE {
        script.push_str(&format!("d\n{}\n", part));
    }
    script.push_str("n\np\n1\n1\n+16M\n");
    script.push_str("n\np\n2\n\n\n");
    script.push_str("t\n1\n0x53\n\n");
    script.push_str("w\nq\n");
    script
}

/// `fff` - hand the staged image to kobs-ng for NAND boot.
pub fn handle_fff<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    let config = ctx.config;
    ctx.state.close_target();
    for name in ["mtd1", "mtd0"] {
        devnode::mk_devnode(
            &config.sys_root,
            "class/mtd",
            name,
            &config.dev_path(name),
            NodeKind::Char,
        )?;
    }

    let command = format!(
        "{} -v -d {}",
        config.tools.kobs_ng,
        config.target_file.display()
    );
    let code = run_to_completion(ctx, &command, None)?;
    Ok(Reply::from_exit_code(code).into())
}

/// `ffs` - partition the SD card and write the staged image to its boot
/// partition.
pub fn handle_ffs<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    let config = ctx.config;
    ctx.state.close_target();

    let disk = config.dev_path("mmc");
    devnode::mk_devnode(&config.sys_root, "block", "mmcblk0", &disk, NodeKind::Block)?;
    let fdisk = format!("{} {}", config.tools.fdisk, disk.display());
    let code = run_to_completion(ctx, &fdisk, Some(fdisk_script().as_bytes()))?;
    if code != 0 {
        warn!(code, "fdisk failed");
        return Ok(Reply::from_exit_code(code).into());
    }

    let settle = config.timing.partition_settle();
    info!(secs = settle.as_secs(), "Waiting for partition rescan");
    thread::sleep(settle);

    let boot = config.dev_path("mmc0p1");
    devnode::mk_devnode(
        &config.sys_root,
        "block/mmcblk0",
        "mmcblk0p1",
        &boot,
        NodeKind::Block,
    )?;

    let steps = [
        format!(
            "{} if=/dev/zero of={} bs=512 count=4",
            config.tools.dd,
            boot.display()
        ),
        format!(
            "{} if={} of={} ibs=512 seek=4 conv=sync,notrunc",
            config.tools.dd,
            config.target_file.display(),
            boot.display()
        ),
    ];
    for step in &steps {
        let code = run_to_completion(ctx, step, None)?;
        if code != 0 {
            warn!(code, command = %step, "dd failed");
            return Ok(Reply::from_exit_code(code).into());
        }
    }
    info!(partition = %boot.display(), "Boot image written");
    Ok(Reply::okay().into())
}

/// `wrf<n>` - stream into `ubiformat` on `/dev/mtd<n>`.
pub fn handle_wrf<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    index: &str,
    size: u64,
) -> Result<HandleResult> {
    let config = ctx.config;
    let index = parse_index("wrf", index)?;
    let name = format!("mtd{}", index);
    let node = config.dev_path(&name);
    devnode::mk_devnode(&config.sys_root, "class/mtd", &name, &node, NodeKind::Char)?;

    let command = format!(
        "{} {} -f - -S {}",
        config.tools.ubiformat,
        node.display(),
        size
    );
    start_pipe(ctx, &command, Some(size))
}

/// `wrs<n>` - stream into `dd` on `/dev/mmcblk0p<n>`.
pub fn handle_wrs<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    index: &str,
    size: u64,
) -> Result<HandleResult> {
    let config = ctx.config;
    let index = parse_index("wrs", index)?;
    let name = format!("mmcblk0p{}", index);
    let node = config.dev_path(&name);
    devnode::mk_devnode(
        &config.sys_root,
        "block/mmcblk0",
        &name,
        &node,
        NodeKind::Block,
    )?;
    if size % 1024 != 0 {
        warn!(size, "Image size is not a multiple of 1K; dd pads the last block");
    }

    let command = format!("{} of={} bs=1K", config.tools.dd, node.display());
    start_pipe(ctx, &command, Some(size))
}

/// `untar.<c> <dir>` - stream into `tar <c>xv -C <dir>`.
pub fn handle_untar<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    rest: &str,
) -> Result<HandleResult> {
    let bad = || CommandError::BadArgument {
        command: "untar",
        argument: rest.to_string(),
    };
    let (compression, dir) = rest.split_once(char::is_whitespace).ok_or_else(bad)?;
    let dir = dir.trim();
    if dir.is_empty() {
        return Err(bad().into());
    }

    let command = format!("{} {}xv -C {}", ctx.config.tools.tar, compression, dir);
    start_pipe(ctx, &command, None)
}

/// `mknod <class>,<item>[,<node>[,<type>]]`.
pub fn handle_mknod<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
    args: &str,
) -> Result<HandleResult> {
    let request = MknodRequest::parse(args, &ctx.config.dev_root)?;
    request.apply(&ctx.config.sys_root)?;
    info!(node = %request.node.display(), "Device node ready");
    Ok(Reply::okay().into())
}

fn parse_index(command: &'static str, index: &str) -> Result<u32, CommandError> {
    index.trim().parse().map_err(|_| CommandError::BadArgument {
        command,
        argument: index.to_string(),
    })
}
