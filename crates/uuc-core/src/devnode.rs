//! Device special files created from sysfs metadata.
//!
//! `<sys_root>/<class>/<name>/dev` holds `major:minor`; the node is created
//! with mode 0666 unless something already exists at that path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::STATUS_INVALID;

#[derive(Error, Debug)]
pub enum DevNodeError {
    #[error("No sysfs entry at {path}: {source}")]
    MissingSysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed device number {0:?}")]
    BadDeviceNumber(String),

    #[error("mknod {node} failed: {source}")]
    Create {
        node: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("Malformed mknod arguments: {0:?}")]
    BadArguments(String),
}

impl DevNodeError {
    /// Status code reported to the host.
    pub fn status(&self) -> i32 {
        match self {
            DevNodeError::Create { source, .. } => -(*source as i32),
            _ => STATUS_INVALID,
        }
    }
}

/// Node type passed to mknod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Char,
    Block,
}

impl NodeKind {
    fn sflag(self) -> SFlag {
        match self {
            NodeKind::Char => SFlag::S_IFCHR,
            NodeKind::Block => SFlag::S_IFBLK,
        }
    }
}

/// Ensure `node` exists, creating it from `<sys_root>/<class>/<name>/dev`.
pub fn mk_devnode(
    sys_root: &Path,
    class: &str,
    name: &str,
    node: &Path,
    kind: NodeKind,
) -> Result<(), DevNodeError> {
    if node.exists() {
        debug!(node = %node.display(), "Device node already exists");
        return Ok(());
    }

    let sys = sys_root.join(class).join(name).join("dev");
    let text = fs::read_to_string(&sys).map_err(|source| DevNodeError::MissingSysfs {
        path: sys.clone(),
        source,
    })?;
    let (major, minor) = parse_dev_numbers(&text)?;

    info!(node = %node.display(), major, minor, ?kind, "Creating device node");
    let _ = fs::remove_file(node);
    mknod(
        node,
        kind.sflag(),
        Mode::from_bits_truncate(0o666),
        makedev(major, minor),
    )
    .map_err(|source| DevNodeError::Create {
        node: node.to_path_buf(),
        source,
    })
}

/// Parse the `major:minor` contents of a sysfs `dev` attribute.
pub fn parse_dev_numbers(text: &str) -> Result<(u64, u64), DevNodeError> {
    let bad = || DevNodeError::BadDeviceNumber(text.trim().to_string());
    let (major, minor) = text.trim().split_once(':').ok_or_else(bad)?;
    let major = major.parse().map_err(|_| bad())?;
    let minor = minor.parse().map_err(|_| bad())?;
    Ok((major, minor))
}

/// Arguments of the `mknod <class>,<item>[,<node>[,<type>]]` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MknodRequest {
    pub class: String,
    pub item: String,
    pub node: PathBuf,
    pub kind: NodeKind,
}

impl MknodRequest {
    /// Parse the argument list; fields are separated by any of ` \t,;`.
    ///
    /// `node` defaults to `<dev_root>/<item>`; `block`/`blk` select a block
    /// device, anything else a character device.
    pub fn parse(args: &str, dev_root: &Path) -> Result<Self, DevNodeError> {
        let mut fields = args
            .split([' ', '\t', ',', ';'])
            .filter(|f| !f.is_empty());
        let class = fields.next();
        let item = fields.next();
        let (Some(class), Some(item)) = (class, item) else {
            return Err(DevNodeError::BadArguments(args.to_string()));
        };
        let node = fields
            .next()
            .map(PathBuf::from)
            .unwrap_or_else(|| dev_root.join(item));
        let kind = match fields.next() {
            Some("block") | Some("blk") => NodeKind::Block,
            _ => NodeKind::Char,
        };
        Ok(Self {
            class: class.to_string(),
            item: item.to_string(),
            node,
            kind,
        })
    }

    pub fn apply(&self, sys_root: &Path) -> Result<(), DevNodeError> {
        mk_devnode(sys_root, &self.class, &self.item, &self.node, self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dev_numbers() {
        assert_eq!(parse_dev_numbers("179:1\n").unwrap(), (179, 1));
        assert!(parse_dev_numbers("179").is_err());
        assert!(parse_dev_numbers("a:b").is_err());
    }

    #[test]
    fn test_mknod_defaults() {
        let req = MknodRequest::parse("class/mtd,mtd3", Path::new("/dev")).unwrap();
        assert_eq!(req.class, "class/mtd");
        assert_eq!(req.item, "mtd3");
        assert_eq!(req.node, PathBuf::from("/dev/mtd3"));
        assert_eq!(req.kind, NodeKind::Char);
    }

    #[test]
    fn test_mknod_full_arguments() {
        let req =
            MknodRequest::parse("block, mmcblk0\t/dev/mmc;blk", Path::new("/dev")).unwrap();
        assert_eq!(req.node, PathBuf::from("/dev/mmc"));
        assert_eq!(req.kind, NodeKind::Block);
        assert!(MknodRequest::parse("block", Path::new("/dev")).is_err());
    }

    #[test]
    fn test_existing_node_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("utp");
        fs::write(&node, b"").unwrap();
        mk_devnode(dir.path(), "class/misc", "utp", &node, NodeKind::Char).unwrap();
    }

    #[test]
    fn test_missing_sysfs_entry() {
        let dir = tempfile::tempdir().unwrap();
        let node = dir.path().join("mtd9");
        let err = mk_devnode(dir.path(), "class/mtd", "mtd9", &node, NodeKind::Char)
            .unwrap_err();
        assert!(matches!(err, DevNodeError::MissingSysfs { .. }));
        assert_eq!(err.status(), STATUS_INVALID);
    }
}
