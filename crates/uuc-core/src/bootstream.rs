//! Boot-stream writer for SD/MMC media.
//!
//! The ROM looks for a partition of type `'S'`, reads a Boot Control Block
//! from its first sector and loads the firmware image from one of the two
//! copies the BCB points at.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;
use tracing::{info, instrument};

pub const SECTOR_SIZE: u64 = 512;
pub const MBR_SIGNATURE: u16 = 0xAA55;
/// Partition type the ROM searches for.
pub const BOOT_PARTITION_TYPE: u8 = b'S';

pub const BCB_SIGNATURE: u32 = 0x0011_2233;
pub const BCB_PRIMARY_TAG: u32 = 1;
pub const BCB_SECONDARY_TAG: u32 = 2;
pub const BCB_SIZE: usize = 16 + 2 * DRIVE_INFO_SIZE;
/// Sectors reserved ahead of the first firmware copy.
pub const BCB_RESERVED_SECTORS: u32 = 4;

const MBR_CODE_SIZE: usize = 446;
const PTE_SIZE: usize = 16;
const PTE_COUNT: usize = 4;
const MBR_SIZE: usize = MBR_CODE_SIZE + PTE_SIZE * PTE_COUNT + 2;
const DRIVE_INFO_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum BootStreamError {
    #[error("Bad MBR signature {0:#06x}")]
    BadSignature(u16),

    #[error("No boot partition (type 'S') in partition table")]
    NoBootPartition,

    #[error("Boot partition too small: {count} sectors, need {needed}")]
    PartitionTooSmall { count: u32, needed: u32 },

    #[error("Boot partition at sector {start} ({count} sectors) is out of range")]
    PartitionOutOfRange { start: u32, count: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BootStreamError {
    pub fn status(&self) -> i32 {
        match self {
            BootStreamError::Io(e) => e.raw_os_error().map(|n| -n).unwrap_or(-1),
            _ => -1,
        }
    }
}

/// One primary partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub active: u8,
    pub kind: u8,
    pub start: u32,
    pub count: u32,
}

impl PartitionEntry {
    fn parse(raw: &[u8]) -> Self {
        Self {
            active: raw[0],
            kind: raw[4],
            start: LittleEndian::read_u32(&raw[8..12]),
            count: LittleEndian::read_u32(&raw[12..16]),
        }
    }
}

/// Master boot record: only the partition table matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mbr {
    pub partitions: [PartitionEntry; PTE_COUNT],
}

impl Mbr {
    pub fn parse(raw: &[u8; MBR_SIZE]) -> Result<Self, BootStreamError> {
        let signature = LittleEndian::read_u16(&raw[MBR_SIZE - 2..]);
        if signature != MBR_SIGNATURE {
            return Err(BootStreamError::BadSignature(signature));
        }
        let table = &raw[MBR_CODE_SIZE..MBR_CODE_SIZE + PTE_SIZE * PTE_COUNT];
        let mut partitions = [PartitionEntry::parse(&table[..PTE_SIZE]); PTE_COUNT];
        for (i, chunk) in table.chunks_exact(PTE_SIZE).enumerate() {
            partitions[i] = PartitionEntry::parse(chunk);
        }
        Ok(Self { partitions })
    }

    pub fn read_from<R: Read + Seek>(dev: &mut R) -> Result<Self, BootStreamError> {
        let mut raw = [0u8; MBR_SIZE];
        dev.seek(SeekFrom::Start(0))?;
        dev.read_exact(&mut raw)?;
        Self::parse(&raw)
    }

    pub fn boot_partition(&self) -> Option<&PartitionEntry> {
        self.partitions
            .iter()
            .find(|p| p.kind == BOOT_PARTITION_TYPE)
    }
}

/// Boot Control Block with two firmware copies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bcb {
    pub first_sectors: [u32; 2],
}

impl Bcb {
    /// Lay out two copies of a `firmware_len` image inside `partition`.
    pub fn for_partition(
        partition: &PartitionEntry,
        firmware_len: usize,
    ) -> Result<Self, BootStreamError> {
        let fw_sectors = sectors_for(firmware_len);
        let needed = fw_sectors
            .checked_mul(2)
            .and_then(|n| n.checked_add(BCB_RESERVED_SECTORS));
        match needed {
            Some(needed) if needed <= partition.count => {}
            _ => {
                return Err(BootStreamError::PartitionTooSmall {
                    count: partition.count,
                    needed: needed.unwrap_or(u32::MAX),
                });
            }
        }

        let out_of_range = || BootStreamError::PartitionOutOfRange {
            start: partition.start,
            count: partition.count,
        };
        let first = partition
            .start
            .checked_add(BCB_RESERVED_SECTORS)
            .ok_or_else(out_of_range)?;
        let second = first.checked_add(fw_sectors).ok_or_else(out_of_range)?;
        // The second copy must end inside the 32-bit sector space too.
        second.checked_add(fw_sectors).ok_or_else(out_of_range)?;
        Ok(Self {
            first_sectors: [first, second],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BCB_SIZE);
        // Infallible on Vec.
        let _ = self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u32::<LittleEndian>(BCB_SIGNATURE)?;
        out.write_u32::<LittleEndian>(BCB_PRIMARY_TAG)?;
        out.write_u32::<LittleEndian>(BCB_SECONDARY_TAG)?;
        out.write_u32::<LittleEndian>(2)?;
        for (tag, first) in [BCB_PRIMARY_TAG, BCB_SECONDARY_TAG]
            .into_iter()
            .zip(self.first_sectors)
        {
            out.write_u32::<LittleEndian>(0)?; // chip
            out.write_u32::<LittleEndian>(0)?; // drive type
            out.write_u32::<LittleEndian>(tag)?;
            out.write_u32::<LittleEndian>(first)?;
            out.write_u32::<LittleEndian>(0)?; // sector count
        }
        Ok(())
    }
}

/// Sectors covering `len` bytes, saturating at `u32::MAX`.
fn sectors_for(len: usize) -> u32 {
    u32::try_from((len as u64).div_ceil(SECTOR_SIZE)).unwrap_or(u32::MAX)
}

/// Write the BCB and both firmware copies into the boot partition of `dev`.
#[instrument(skip(dev, firmware), fields(firmware_len = firmware.len()))]
pub fn write_boot_stream<D: Read + Write + Seek>(
    dev: &mut D,
    firmware: &[u8],
) -> Result<Bcb, BootStreamError> {
    let mbr = Mbr::read_from(dev)?;
    let partition = *mbr
        .boot_partition()
        .ok_or(BootStreamError::NoBootPartition)?;
    let bcb = Bcb::for_partition(&partition, firmware.len())?;

    dev.seek(SeekFrom::Start(partition.start as u64 * SECTOR_SIZE))?;
    dev.write_all(&bcb.encode())?;
    for first in bcb.first_sectors {
        dev.seek(SeekFrom::Start(first as u64 * SECTOR_SIZE))?;
        dev.write_all(firmware)?;
    }
    dev.flush()?;

    info!(
        start = partition.start,
        primary = bcb.first_sectors[0],
        secondary = bcb.first_sectors[1],
        "Boot stream written"
    );
    Ok(bcb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn disk(kind: u8, start: u32, count: u32) -> Cursor<Vec<u8>> {
        let mut image = vec![0u8; 64 * 1024];
        let pte = MBR_CODE_SIZE + PTE_SIZE; // second slot
        image[pte + 4] = kind;
        LittleEndian::write_u32(&mut image[pte + 8..pte + 12], start);
        LittleEndian::write_u32(&mut image[pte + 12..pte + 16], count);
        LittleEndian::write_u16(&mut image[MBR_SIZE - 2..MBR_SIZE], MBR_SIGNATURE);
        Cursor::new(image)
    }

    #[test]
    fn test_bcb_layout() {
        let part = PartitionEntry {
            active: 0,
            kind: b'S',
            start: 16,
            count: 100,
        };
        let bcb = Bcb::for_partition(&part, 1000).unwrap();
        assert_eq!(bcb.first_sectors, [20, 22]);

        let raw = bcb.encode();
        assert_eq!(raw.len(), BCB_SIZE);
        assert_eq!(LittleEndian::read_u32(&raw[0..4]), BCB_SIGNATURE);
        assert_eq!(LittleEndian::read_u32(&raw[12..16]), 2);
        // drive_info[0].tag, first_sector
        assert_eq!(LittleEndian::read_u32(&raw[24..28]), 1);
        assert_eq!(LittleEndian::read_u32(&raw[28..32]), 20);
        // drive_info[1].tag, first_sector
        assert_eq!(LittleEndian::read_u32(&raw[44..48]), 2);
        assert_eq!(LittleEndian::read_u32(&raw[48..52]), 22);
    }

    #[test]
    fn test_write_boot_stream() {
        let mut dev = disk(b'S', 8, 64);
        let firmware: Vec<u8> = (0..700u32).map(|i| i as u8).collect();

        let bcb = write_boot_stream(&mut dev, &firmware).unwrap();
        assert_eq!(bcb.first_sectors, [12, 14]);

        let image = dev.into_inner();
        let bcb_at = 8 * 512;
        assert_eq!(
            LittleEndian::read_u32(&image[bcb_at..bcb_at + 4]),
            BCB_SIGNATURE
        );
        assert_eq!(&image[12 * 512..12 * 512 + 700], &firmware[..]);
        assert_eq!(&image[14 * 512..14 * 512 + 700], &firmware[..]);
    }

    #[test]
    fn test_errors() {
        let mut no_boot = disk(0x83, 8, 64);
        assert!(matches!(
            write_boot_stream(&mut no_boot, &[0; 10]),
            Err(BootStreamError::NoBootPartition)
        ));

        let mut small = disk(b'S', 8, 5);
        assert!(matches!(
            write_boot_stream(&mut small, &[0; 1024]),
            Err(BootStreamError::PartitionTooSmall { count: 5, needed: 8 })
        ));

        let mut blank = Cursor::new(vec![0u8; 1024]);
        assert!(matches!(
            write_boot_stream(&mut blank, &[0; 10]),
            Err(BootStreamError::BadSignature(0))
        ));
    }

    #[test]
    fn test_partition_near_sector_limit() {
        let part = PartitionEntry {
            active: 0,
            kind: b'S',
            start: u32::MAX - 2,
            count: 64,
        };
        assert!(matches!(
            Bcb::for_partition(&part, 700),
            Err(BootStreamError::PartitionOutOfRange { count: 64, .. })
        ));

        let mut dev = disk(b'S', u32::MAX - 3, 64);
        assert!(matches!(
            write_boot_stream(&mut dev, &[0; 700]),
            Err(BootStreamError::PartitionOutOfRange { .. })
        ));
    }

    #[test]
    fn test_firmware_larger_than_sector_space() {
        let part = PartitionEntry {
            active: 0,
            kind: b'S',
            start: 0,
            count: u32::MAX,
        };
        assert!(matches!(
            Bcb::for_partition(&part, usize::MAX),
            Err(BootStreamError::PartitionTooSmall {
                needed: u32::MAX,
                ..
            })
        ));
    }
}
