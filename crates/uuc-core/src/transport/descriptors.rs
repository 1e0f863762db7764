//! FunctionFS descriptor and string blobs written to `ep0` at startup.
//!
//! One vendor-specific interface with a bulk IN sink (`0x81`) and a bulk
//! OUT source (`0x02`) at full, high and super speed, plus Microsoft OS
//! descriptors so Windows hosts bind WinUSB without a driver package.

use std::io;

use byteorder::{LittleEndian, WriteBytesExt};

const FUNCTIONFS_DESCRIPTORS_MAGIC_V2: u32 = 3;
const FUNCTIONFS_STRINGS_MAGIC: u32 = 2;

const FUNCTIONFS_HAS_FS_DESC: u32 = 1;
const FUNCTIONFS_HAS_HS_DESC: u32 = 2;
const FUNCTIONFS_HAS_SS_DESC: u32 = 4;
const FUNCTIONFS_HAS_MS_OS_DESC: u32 = 8;

const USB_DT_INTERFACE: u8 = 0x04;
const USB_DT_ENDPOINT: u8 = 0x05;
const USB_DT_SS_ENDPOINT_COMP: u8 = 0x30;
const USB_CLASS_VENDOR_SPEC: u8 = 0xFF;
const USB_ENDPOINT_XFER_BULK: u8 = 0x02;

/// Device-to-host endpoint (`ep1`).
pub const EP_SINK_ADDRESS: u8 = 0x81;
/// Host-to-device endpoint (`ep2`).
pub const EP_SOURCE_ADDRESS: u8 = 0x02;

const INTERFACE_STRING: &[u8] = b"utp\0";
const LANG_EN_US: u16 = 0x0409;

const WINUSB_COMPAT_ID: [u8; 8] = *b"WINUSB\0\0";
const PROPERTY_NAME: &[u8] = b"DeviceInterfaceGUID\0";
const PROPERTY_DATA: &[u8] = b"{4866319A-F4D6-4374-93B9-DC2DEB361BA9}\0";

const INTERFACE_DESC_LEN: u8 = 9;
const ENDPOINT_DESC_LEN: u8 = 7;
const SS_COMP_DESC_LEN: u8 = 6;
const OS_HEADER_LEN: u32 = 11;
const EXT_COMPAT_LEN: u32 = 24;
const EXT_PROP_HEADER_LEN: u32 = 10;

#[derive(Debug, Clone, Copy)]
enum Speed {
    Full,
    High,
    Super,
}

impl Speed {
    fn max_packet(self) -> u16 {
        match self {
            Speed::Full => 0,
            Speed::High => 512,
            Speed::Super => 1024,
        }
    }

    fn source_interval(self) -> u8 {
        match self {
            Speed::Full => 0,
            // NAK every microframe.
            Speed::High | Speed::Super => 1,
        }
    }
}

/// Build the v2 descriptor blob.
pub fn descriptors() -> io::Result<Vec<u8>> {
    let mut body = Vec::with_capacity(256);

    body.write_u32::<LittleEndian>(3)?; // fs_count
    body.write_u32::<LittleEndian>(3)?; // hs_count
    body.write_u32::<LittleEndian>(5)?; // ss_count
    body.write_u32::<LittleEndian>(2)?; // os_count

    for speed in [Speed::Full, Speed::High, Speed::Super] {
        write_interface(&mut body)?;
        write_endpoint(&mut body, EP_SINK_ADDRESS, speed.max_packet(), 0)?;
        if matches!(speed, Speed::Super) {
            write_ss_companion(&mut body)?;
        }
        write_endpoint(
            &mut body,
            EP_SOURCE_ADDRESS,
            speed.max_packet(),
            speed.source_interval(),
        )?;
        if matches!(speed, Speed::Super) {
            write_ss_companion(&mut body)?;
        }
    }

    write_os_descriptors(&mut body)?;

    let mut blob = Vec::with_capacity(12 + body.len());
    blob.write_u32::<LittleEndian>(FUNCTIONFS_DESCRIPTORS_MAGIC_V2)?;
    blob.write_u32::<LittleEndian>((12 + body.len()) as u32)?;
    blob.write_u32::<LittleEndian>(
        FUNCTIONFS_HAS_FS_DESC
            | FUNCTIONFS_HAS_HS_DESC
            | FUNCTIONFS_HAS_SS_DESC
            | FUNCTIONFS_HAS_MS_OS_DESC,
    )?;
    blob.extend_from_slice(&body);
    Ok(blob)
}

/// Build the strings blob (one language, one string).
pub fn strings() -> io::Result<Vec<u8>> {
    let length = 16 + 2 + INTERFACE_STRING.len();
    let mut blob = Vec::with_capacity(length);
    blob.write_u32::<LittleEndian>(FUNCTIONFS_STRINGS_MAGIC)?;
    blob.write_u32::<LittleEndian>(length as u32)?;
    blob.write_u32::<LittleEndian>(1)?; // str_count
    blob.write_u32::<LittleEndian>(1)?; // lang_count
    blob.write_u16::<LittleEndian>(LANG_EN_US)?;
    blob.extend_from_slice(INTERFACE_STRING);
    Ok(blob)
}

fn write_interface(buf: &mut Vec<u8>) -> io::Result<()> {
    buf.write_u8(INTERFACE_DESC_LEN)?;
    buf.write_u8(USB_DT_INTERFACE)?;
    buf.write_u8(0)?; // bInterfaceNumber
    buf.write_u8(0)?; // bAlternateSetting
    buf.write_u8(2)?; // bNumEndpoints
    buf.write_u8(USB_CLASS_VENDOR_SPEC)?;
    buf.write_u8(0)?; // bInterfaceSubClass
    buf.write_u8(0)?; // bInterfaceProtocol
    buf.write_u8(1) // iInterface
}

fn write_endpoint(buf: &mut Vec<u8>, address: u8, max_packet: u16, interval: u8) -> io::Result<()> {
    buf.write_u8(ENDPOINT_DESC_LEN)?;
    buf.write_u8(USB_DT_ENDPOINT)?;
    buf.write_u8(address)?;
    buf.write_u8(USB_ENDPOINT_XFER_BULK)?;
    buf.write_u16::<LittleEndian>(max_packet)?;
    buf.write_u8(interval)
}

fn write_ss_companion(buf: &mut Vec<u8>) -> io::Result<()> {
    buf.write_u8(SS_COMP_DESC_LEN)?;
    buf.write_u8(USB_DT_SS_ENDPOINT_COMP)?;
    buf.write_u8(0)?; // bMaxBurst
    buf.write_u8(0)?; // bmAttributes
    buf.write_u16::<LittleEndian>(0) // wBytesPerInterval
}

fn write_os_descriptors(buf: &mut Vec<u8>) -> io::Result<()> {
    // Extended compat ID: WINUSB on interface 0.
    buf.write_u8(1)?; // interface
    buf.write_u32::<LittleEndian>(OS_HEADER_LEN + EXT_COMPAT_LEN)?;
    buf.write_u16::<LittleEndian>(1)?; // bcdVersion
    buf.write_u16::<LittleEndian>(4)?; // wIndex
    buf.write_u8(1)?; // bCount
    buf.write_u8(0)?; // Reserved

    buf.write_u8(0)?; // bFirstInterfaceNumber
    buf.write_u8(1)?; // Reserved1
    buf.extend_from_slice(&WINUSB_COMPAT_ID);
    buf.extend_from_slice(&[0u8; 8]); // SubCompatibleID
    buf.extend_from_slice(&[0u8; 6]); // Reserved2

    // Extended property: DeviceInterfaceGUID.
    let prop_size =
        EXT_PROP_HEADER_LEN + PROPERTY_NAME.len() as u32 + 4 + PROPERTY_DATA.len() as u32;
    buf.write_u8(0)?; // interface
    buf.write_u32::<LittleEndian>(OS_HEADER_LEN + prop_size)?;
    buf.write_u16::<LittleEndian>(1)?; // bcdVersion
    buf.write_u16::<LittleEndian>(5)?; // wIndex
    buf.write_u16::<LittleEndian>(1)?; // wCount

    buf.write_u32::<LittleEndian>(prop_size)?;
    buf.write_u32::<LittleEndian>(1)?; // REG_SZ
    buf.write_u16::<LittleEndian>(PROPERTY_NAME.len() as u16)?;
    buf.extend_from_slice(PROPERTY_NAME);
    buf.write_u32::<LittleEndian>(PROPERTY_DATA.len() as u32)?;
    buf.extend_from_slice(PROPERTY_DATA);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
    }

    #[test]
    fn test_descriptor_header() {
        let blob = descriptors().unwrap();
        assert_eq!(blob.len(), 228);
        assert_eq!(le32(&blob, 0), FUNCTIONFS_DESCRIPTORS_MAGIC_V2);
        assert_eq!(le32(&blob, 4), 228);
        assert_eq!(le32(&blob, 8), 0xF);
        assert_eq!(le32(&blob, 12), 3);
        assert_eq!(le32(&blob, 24), 2);
    }

    #[test]
    fn test_high_speed_endpoints() {
        let blob = descriptors().unwrap();
        // header (12) + counts (16) + full-speed block (23)
        let hs = 12 + 16 + 23;
        assert_eq!(blob[hs + 1], USB_DT_INTERFACE);
        assert_eq!(blob[hs + 5], USB_CLASS_VENDOR_SPEC);
        let sink = hs + 9;
        assert_eq!(blob[sink + 2], EP_SINK_ADDRESS);
        assert_eq!(u16::from_le_bytes([blob[sink + 4], blob[sink + 5]]), 512);
        let source = sink + 7;
        assert_eq!(blob[source + 2], EP_SOURCE_ADDRESS);
        assert_eq!(blob[source + 6], 1);
    }

    #[test]
    fn test_ms_os_property() {
        let blob = descriptors().unwrap();
        let tail = &blob[blob.len() - PROPERTY_DATA.len()..];
        assert_eq!(tail, PROPERTY_DATA);
        let compat = blob
            .windows(WINUSB_COMPAT_ID.len())
            .position(|w| w == WINUSB_COMPAT_ID);
        assert!(compat.is_some());
    }

    #[test]
    fn test_strings_blob() {
        let blob = strings().unwrap();
        assert_eq!(blob.len(), 22);
        assert_eq!(le32(&blob, 0), FUNCTIONFS_STRINGS_MAGIC);
        assert_eq!(le32(&blob, 4), 22);
        assert_eq!(&blob[16..18], &LANG_EN_US.to_le_bytes());
        assert_eq!(&blob[18..], b"utp\0");
    }
}
