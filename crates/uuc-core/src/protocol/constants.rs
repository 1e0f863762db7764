//! Protocol constants shared by both transports.
//!
//! Derived from the i.MX `uuc` (UTP) and `ufb` (FunctionFS fastboot) daemons.

// ============================================================================
// Fixed-frame transport (FunctionFS bulk endpoints)
// ============================================================================

/// Size of one request/reply frame on the bulk endpoints.
pub const MAX_FRAME_SIZE: usize = 64;

/// Size of the ASCII reply tag at the start of every frame.
pub const FRAME_TAG_SIZE: usize = 4;

/// Payload bytes available after the tag.
pub const MAX_FRAME_DATA_SIZE: usize = MAX_FRAME_SIZE - FRAME_TAG_SIZE;

/// Largest command accepted from the source endpoint in one read.
pub const MAX_COMMAND_SIZE: usize = 511;

/// Reply tags as they appear on the wire.
pub const TAG_INFO: [u8; 4] = *b"INFO";
pub const TAG_OKAY: [u8; 4] = *b"OKAY";
pub const TAG_FAIL: [u8; 4] = *b"FAIL";
pub const TAG_DATA: [u8; 4] = *b"DATA";

/// Number of hex digits in a DATA length announcement (`%08X`).
pub const DATA_LEN_DIGITS: usize = 8;

/// Receive buffers are rounded up to this many bytes (chipidea sg alignment).
pub const CACHE_LINE: usize = 0x80;

/// Largest chunk returned by a single `upload`.
pub const UPLOAD_CHUNK: usize = 0x10000;

/// Slice size for writes into a download target.
pub const WRITE_SLICE: usize = 0x10000;

/// FAIL detail when the subprocess closed its stdin.
pub const DETAIL_EPIPE: &[u8] = b"EPIPE";

/// FAIL detail when a write target is an existing directory.
pub const DETAIL_DIR: &[u8] = b"DIR";

// ============================================================================
// Message transport (/dev/utp character device)
// ============================================================================

/// Default UTP character device.
pub const UTP_DEVNODE: &str = "/dev/utp";

/// Maximum payload of one inbound UTP message.
pub const UTP_MAX_PAYLOAD: usize = 0x10000;

/// Message carries a command.
pub const UTP_FLAG_COMMAND: u32 = 0x0000_0001;
/// Message carries data.
pub const UTP_FLAG_DATA: u32 = 0x0000_0002;
/// Message carries a non-success status.
pub const UTP_FLAG_STATUS: u32 = 0x0000_0004;
/// Early heartbeat for long-running commands.
pub const UTP_FLAG_REPORT_BUSY: u32 = 0x1000_0000;

/// `_IOR('U', 0, int)` on the UTP device.
pub const UTP_IOCTL_BASE: u8 = b'U';

// ============================================================================
// Status codes
// ============================================================================

/// Status for unknown commands (`-EINVAL`).
pub const STATUS_INVALID: i32 = -22;

/// Status when the subprocess slot is occupied (`-EBUSY`).
pub const STATUS_BUSY: i32 = -16;

/// Status for a broken pipe into the subprocess (`-EPIPE`).
pub const STATUS_EPIPE: i32 = -32;

/// Generic failure status.
pub const STATUS_FAILURE: i32 = -1;

// ============================================================================
// Device defaults
// ============================================================================

/// Default staging file for firmware writes.
pub const DEFAULT_TARGET_FILE: &str = "/tmp/file.utp";

/// Default FunctionFS control endpoint.
pub const DEFAULT_FFS_EP0: &str = "/dev/usb-ffs/ep0";

/// Daemon version reported in the query descriptor (`<DCE>`).
pub const DAEMON_VERSION: &str = "0.4";
