//! Partition table inspection for firmware images.
//!
//! Firmware images are whole-disk images; nothing here needs a block
//! device, everything operates on the image file directly.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cpe_upgrade_utils::CommandRunExt;
use fn_error_context::context;
use serde::Deserialize;

/// The sector size of the devices we emulate; partition tables in
/// firmware images are always expressed in these units.
pub const SECTOR_SIZE: u64 = 512;

/// The partition number holding the root filesystem.
pub const ROOTFS_PARTNO: u32 = 2;

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A partition as reported by `sfdisk --json`.
#[derive(Debug, Deserialize)]
#[allow(missing_docs)]
pub struct Partition {
    pub node: String,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub parttype: Option<String>,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

impl Partition {
    /// Derive the partition number from the node name, which is the
    /// device name followed by the number (optionally separated by `p`).
    pub fn number(&self, device: &str) -> Option<u32> {
        let suffix = self.node.strip_prefix(device)?;
        let suffix = suffix.strip_prefix('p').unwrap_or(suffix);
        suffix.parse().ok()
    }
}

/// The partition table type, as reported by sfdisk.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// Legacy MBR
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else
    #[serde(other)]
    Unknown,
}

/// A partition table as reported by `sfdisk --json`.
#[derive(Debug, Deserialize)]
#[allow(missing_docs)]
pub struct PartitionTable {
    pub label: PartitionType,
    pub id: Option<String>,
    pub device: String,
    pub sectorsize: Option<u64>,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Normalize into numbered entries; partitions whose number cannot be
    /// derived from their node name are skipped.
    pub fn entries(&self) -> Vec<PartitionEntry> {
        self.partitions
            .iter()
            .filter_map(|p| {
                let number = p.number(&self.device)?;
                Some(PartitionEntry {
                    number,
                    start: p.start,
                    size: p.size,
                })
            })
            .collect()
    }
}

/// A single `(number, start, size)` row; start and size are in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Partition number, starting at 1
    pub number: u32,
    /// First sector
    pub start: u64,
    /// Length in sectors
    pub size: u64,
}

impl PartitionEntry {
    /// Offset of the partition in bytes from the start of the image, or
    /// `None` if it is not representable.
    pub fn byte_offset(&self) -> Option<u64> {
        self.start.checked_mul(SECTOR_SIZE)
    }

    /// Length of the partition in bytes, or `None` if it is not representable.
    pub fn byte_size(&self) -> Option<u64> {
        self.size.checked_mul(SECTOR_SIZE)
    }

    /// Whether the whole extent of the partition has a byte address.
    fn is_addressable(&self) -> bool {
        self.start
            .checked_add(self.size)
            .and_then(|end| end.checked_mul(SECTOR_SIZE))
            .is_some()
    }
}

/// Find the partition with the given number. Empty partitions, and ones
/// whose extent overflows a byte offset, are treated as absent.
pub fn find_partno(entries: &[PartitionEntry], partno: u32) -> Option<&PartitionEntry> {
    entries
        .iter()
        .find(|e| e.number == partno)
        .filter(|e| e.size > 0 && e.is_addressable())
}

/// Parse the output of `sfdisk --json`.
pub fn parse_sfdisk_json(buf: &str) -> Result<PartitionTable> {
    let o: SfDiskOutput = serde_json::from_str(buf).context("Parsing sfdisk output")?;
    Ok(o.partitiontable)
}

/// Read the partition table of a firmware image with `sfdisk`.
#[context("Listing partitions of {image}")]
pub fn partitions_of(image: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["--json", image.as_str()])
        .log_debug()
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// Parse a partition map as written by the device's native
/// `get_partitions` helper: one `<number> <start> <size>` row per line.
/// Rows that do not parse are ignored.
pub fn parse_partition_map(buf: &str) -> Vec<PartitionEntry> {
    buf.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let number = fields.next()?.parse().ok()?;
            let start = fields.next()?.parse().ok()?;
            let size = fields.next()?.parse().ok()?;
            Some(PartitionEntry {
                number,
                start,
                size,
            })
        })
        .collect()
}

/// Read a native partition map file.
#[context("Reading partition map {path}")]
pub fn read_partition_map(path: &Utf8Path) -> Result<Vec<PartitionEntry>> {
    let buf = std::fs::read_to_string(path)?;
    let entries = parse_partition_map(&buf);
    tracing::debug!("Partition map {path}: {entries:?}");
    Ok(entries)
}
