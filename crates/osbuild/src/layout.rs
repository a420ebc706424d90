//! Single-partition GPT disk layout.
//!
//! ```text
//! LBA 0          protective MBR
//! LBA 1          primary header
//! LBA 2..=33     primary entry array (128 x 128 bytes)
//! LBA 34..=N-34  usable
//! LBA N-33..=N-2 backup entry array
//! LBA N-1        backup header
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Seek, Write};

use gpt::disk::LogicalBlockSize;
use gpt::mbr::ProtectiveMBR;
use gpt::partition::Partition;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, ErrorKind, Result};

pub const SECTOR_SIZE: u64 = 512;
/// Entry array size: 128 entries of 128 bytes.
const ENTRY_SECTORS: u64 = 32;
pub const FIRST_USABLE_LBA: u64 = 2 + ENTRY_SECTORS;
/// Sectors the layout needs outside the usable range.
const OVERHEAD_SECTORS: u64 = 1 + 2 * (1 + ENTRY_SECTORS);

const PARTITION_ID: u32 = 1;

/// Byte length of `sectors` sectors, or a configuration error when it does not fit a u64.
pub fn sector_bytes(sectors: u64) -> Result<u64> {
    sectors.checked_mul(SECTOR_SIZE).ok_or_else(|| {
        Error::config(format!("{sectors} sectors is beyond the addressable byte range"))
    })
}

/// Version-4 layout GUID taken from a SHA-256 of `seed`. Same seed, same GUID.
pub fn derive_guid(seed: &str) -> Uuid {
    let digest = Sha256::digest(seed.as_bytes());
    let mut b = [0u8; 16];
    b.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(b).into_uuid()
}

pub fn parse_guid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|e| Error::config(format!("invalid GUID '{raw}': {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionFlags {
    /// Attribute bit 0: platform required.
    pub required: bool,
    /// Attribute bit 2: legacy BIOS bootable.
    pub legacy_bios_bootable: bool,
}

impl PartitionFlags {
    pub fn bits(self) -> u64 {
        let mut bits = 0u64;
        if self.required {
            bits |= 1 << 0;
        }
        if self.legacy_bios_bootable {
            bits |= 1 << 2;
        }
        bits
    }
}

/// Everything needed to lay out the disk. Fixed per configuration; the partition is
/// always an EFI System Partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskGeometry {
    pub total_sectors: u64,
    pub partition_start: u64,
    pub partition_sectors: u64,
    pub partition_flags: PartitionFlags,
    pub partition_name: String,
    pub disk_guid: Uuid,
    pub partition_guid: Uuid,
}

impl DiskGeometry {
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors.saturating_mul(SECTOR_SIZE)
    }

    pub fn partition_offset(&self) -> u64 {
        self.partition_start.saturating_mul(SECTOR_SIZE)
    }

    pub fn partition_bytes(&self) -> u64 {
        self.partition_sectors.saturating_mul(SECTOR_SIZE)
    }

    /// Inclusive.
    pub fn partition_end(&self) -> u64 {
        self.partition_start
            .saturating_add(self.partition_sectors.saturating_sub(1))
    }

    pub fn last_usable_lba(&self) -> u64 {
        self.total_sectors.saturating_sub(FIRST_USABLE_LBA)
    }

    /// Check that a filesystem image of `fs_bytes` fits this layout. Needs no I/O, so it
    /// runs both when planning (with the configured size) and again before composing.
    pub fn validate(&self, fs_bytes: u64) -> Result<()> {
        if self.partition_sectors == 0 {
            return Err(Error::config("partition has zero sectors"));
        }
        if self.partition_start < FIRST_USABLE_LBA {
            return Err(Error::config(format!(
                "partition start LBA {} overlaps the partition table (first usable LBA is {})",
                self.partition_start, FIRST_USABLE_LBA
            )));
        }
        let total = sector_bytes(self.total_sectors)?;
        let offset = sector_bytes(self.partition_start)?;
        let partition = sector_bytes(self.partition_sectors)?;
        if self.total_sectors < OVERHEAD_SECTORS + 1 {
            return Err(Error::new(
                ErrorKind::ImageTooSmall,
                format!(
                    "disk of {} sectors cannot hold a partition table ({} sectors needed)",
                    self.total_sectors,
                    OVERHEAD_SECTORS + 1
                ),
            ));
        }
        let needed = offset.checked_add(fs_bytes).unwrap_or(u64::MAX);
        if needed > total {
            return Err(Error::new(
                ErrorKind::ImageTooSmall,
                format!(
                    "filesystem image of {fs_bytes} bytes at offset {offset} needs {needed} bytes, disk has {total}"
                ),
            ));
        }
        if self.partition_end() > self.last_usable_lba() {
            return Err(Error::new(
                ErrorKind::ImageTooSmall,
                format!(
                    "partition ends at LBA {} past the last usable LBA {} (image.disk_sectors = {})",
                    self.partition_end(),
                    self.last_usable_lba(),
                    self.total_sectors
                ),
            ));
        }
        if fs_bytes != partition {
            return Err(Error::new(
                ErrorKind::ImageTooSmall,
                format!("filesystem image is {fs_bytes} bytes but the partition holds {partition}"),
            ));
        }
        Ok(())
    }

    fn partition(&self) -> Partition {
        Partition {
            part_type_guid: gpt::partition_types::EFI,
            part_guid: self.partition_guid,
            first_lba: self.partition_start,
            last_lba: self.partition_end(),
            flags: self.partition_flags.bits(),
            name: self.partition_name.clone(),
        }
    }
}

fn table_err<E: fmt::Display>(what: &'static str) -> impl FnOnce(E) -> Error {
    move |e| Error::msg(format!("{what}: {e}"))
}

/// Write the protective MBR and both GPT copies. `dev` is already sized to
/// `geom.total_bytes()`.
pub fn write_tables<D>(dev: &mut D, geom: &DiskGeometry) -> Result<()>
where
    D: Read + Write + Seek + fmt::Debug,
{
    let mbr_size = u32::try_from(geom.total_sectors.saturating_sub(1)).unwrap_or(u32::MAX);
    ProtectiveMBR::with_lb_size(mbr_size)
        .overwrite_lba0(dev)
        .map_err(table_err("cannot write protective MBR"))?;

    let mut disk = gpt::GptConfig::new()
        .writable(true)
        .initialized(false)
        .logical_block_size(LogicalBlockSize::Lb512)
        .create_from_device(Box::new(&mut *dev), Some(geom.disk_guid))
        .map_err(table_err("cannot create partition table"))?;

    let mut partitions = BTreeMap::new();
    partitions.insert(PARTITION_ID, geom.partition());
    disk.update_partitions(partitions)
        .map_err(table_err("cannot add partition"))?;
    disk.write()
        .map_err(table_err("cannot write partition table"))?;
    Ok(())
}
