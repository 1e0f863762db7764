//! Device descriptor and file reads.

use anyhow::{Context, Result};
use tracing::info;

use crate::daemon::IdentityConfig;
use crate::protocol::{DAEMON_VERSION, Reply};
use crate::transport::Transport;

use super::{HandleResult, HandlerContext};

/// `?` - describe the device.
pub fn handle_query<T: Transport + ?Sized>(
    ctx: &mut HandlerContext<'_, T>,
) -> Result<HandleResult> {
    Ok(Reply::Data(device_descriptor(&ctx.config.identity)).into())
}

/// `read <path>` - return the whole file.
pub fn handle_read<T: Transport + ?Sized>(
    _ctx: &mut HandlerContext<'_, T>,
    path: &str,
) -> Result<HandleResult> {
    let path = path.trim();
    let data = std::fs::read(path).with_context(|| format!("Failed to read {}", path))?;
    info!(path, bytes = data.len(), "Read file for host");
    Ok(Reply::Data(data).into())
}

/// NUL-terminated `<DEVICE>` block understood by the host tool.
pub(super) fn device_descriptor(identity: &IdentityConfig) -> Vec<u8> {
    let mut text = format!(
        "<DEVICE>\n <FW>{}</FW>\n <DCE>{}</DCE>\n <SN>{}</SN> <CID>{}</CID> <VID>{:04X}</VID> <PID>{:04X}</PID></DEVICE>\n",
        identity.firmware,
        DAEMON_VERSION,
        identity.serial,
        identity.chip_id,
        identity.vendor_id,
        identity.product_id,
    )
    .into_bytes();
    text.push(0);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_descriptor() {
        let identity = IdentityConfig {
            serial: "0123".to_string(),
            vendor_id: 0x15A2,
            product_id: 0x4F,
            ..Default::default()
        };
        let text = device_descriptor(&identity);
        assert_eq!(
            text,
            b"<DEVICE>\n <FW>2.6.31</FW>\n <DCE>0.4</DCE>\n <SN>0123</SN> <CID>370000A5</CID> <VID>15A2</VID> <PID>004F</PID></DEVICE>\n\0"
        );
    }
}
