//! Locating the root filesystem inside a firmware image.
//!
//! Two independent probes are tried in order: `sfdisk`, then the device's
//! own `get_partitions` shell helper. The first one reporting partition 2
//! wins. We never guess an offset.

use std::fmt::Display;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cpe_upgrade_blockdev::{find_partno, PartitionEntry, ROOTFS_PARTNO};
use cpe_upgrade_utils::CommandRunExt;
use serde::Serialize;

use crate::error::UpgradeError;
use crate::layout::{Layout, PARTITION_MAP};

/// A way of reading the partition table of a firmware image.
pub trait PartitionProbe: std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// List the partitions of the image.
    fn partitions(&self, image: &Utf8Path) -> Result<Vec<PartitionEntry>>;
}

/// Reads the partition table with `sfdisk --json`.
#[derive(Debug, Default)]
pub struct SfdiskProbe;

impl PartitionProbe for SfdiskProbe {
    fn name(&self) -> &'static str {
        "sfdisk"
    }

    fn partitions(&self, image: &Utf8Path) -> Result<Vec<PartitionEntry>> {
        Ok(cpe_upgrade_blockdev::partitions_of(image)?.entries())
    }
}

/// Runs the device's native `get_partitions` helper, which writes a
/// partition map file, and reads that map back.
#[derive(Debug)]
pub struct NativeMapProbe {
    helper: Utf8PathBuf,
    map: Utf8PathBuf,
}

impl NativeMapProbe {
    /// Use the given shell library and the map file it writes.
    pub fn new(helper: impl Into<Utf8PathBuf>, map: impl Into<Utf8PathBuf>) -> Self {
        Self {
            helper: helper.into(),
            map: map.into(),
        }
    }

    /// The helper and map locations of the given layout.
    pub fn for_layout(layout: &Layout) -> Self {
        Self::new(
            layout.path(layout.config().upgrade.native_helper()),
            layout.path(PARTITION_MAP),
        )
    }

    fn remove_map(&self) -> Result<()> {
        match std::fs::remove_file(&self.map) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                Err(e).with_context(|| format!("Removing {}", self.map))
            }
            _ => Ok(()),
        }
    }
}

impl PartitionProbe for NativeMapProbe {
    fn name(&self) -> &'static str {
        "get_partitions"
    }

    fn partitions(&self, image: &Utf8Path) -> Result<Vec<PartitionEntry>> {
        anyhow::ensure!(self.helper.exists(), "Missing native helper {}", self.helper);
        self.remove_map()?;
        let r = Command::new("sh")
            .args([
                "-c",
                r#". "$1" && get_partitions "$2" image"#,
                "sh",
                self.helper.as_str(),
                image.as_str(),
            ])
            .log_debug()
            .run()
            .and_then(|_| cpe_upgrade_blockdev::read_partition_map(&self.map));
        // The map is scratch state; never leave it behind
        self.remove_map()?;
        r
    }
}

/// Location of the root filesystem inside a firmware image, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RootfsPartition {
    /// Offset from the start of the image
    pub offset: u64,
    /// Length of the partition
    pub size: u64,
}

impl TryFrom<&PartitionEntry> for RootfsPartition {
    type Error = anyhow::Error;

    fn try_from(e: &PartitionEntry) -> Result<Self> {
        let invalid = || anyhow::anyhow!("Partition {} out of range: {e:?}", e.number);
        Ok(Self {
            offset: e.byte_offset().ok_or_else(invalid)?,
            size: e.byte_size().ok_or_else(invalid)?,
        })
    }
}

impl Display for RootfsPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "offset {} size {}", self.offset, self.size)
    }
}

/// The probes used in production, in order of preference.
pub fn default_probes(layout: &Layout) -> Vec<Box<dyn PartitionProbe>> {
    vec![
        Box::new(SfdiskProbe),
        Box::new(NativeMapProbe::for_layout(layout)),
    ]
}

/// Find the rootfs partition of the image using the first probe which
/// reports one.
pub fn locate_rootfs_partition(
    probes: &[Box<dyn PartitionProbe>],
    image: &Utf8Path,
) -> Result<RootfsPartition, UpgradeError> {
    for probe in probes {
        let name = probe.name();
        match probe.partitions(image) {
            Ok(entries) => {
                let found = find_partno(&entries, ROOTFS_PARTNO).map(RootfsPartition::try_from);
                match found {
                    Some(Ok(r)) => {
                        tracing::debug!("{name}: rootfs at {r}");
                        return Ok(r);
                    }
                    Some(Err(e)) => tracing::debug!("{name}: {e:#}"),
                    None => tracing::debug!("{name}: no partition {ROOTFS_PARTNO} in {image}"),
                }
            }
            Err(e) => tracing::debug!("{name}: {e:#}"),
        }
    }
    Err(UpgradeError::NoRootfsPartition {
        path: image.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedProbe(Result<Vec<PartitionEntry>, &'static str>);

    impl PartitionProbe for FixedProbe {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn partitions(&self, _image: &Utf8Path) -> Result<Vec<PartitionEntry>> {
            self.0.clone().map_err(anyhow::Error::msg)
        }
    }

    fn entry(number: u32, start: u64, size: u64) -> PartitionEntry {
        PartitionEntry {
            number,
            start,
            size,
        }
    }

    #[test]
    fn test_first_successful_probe_wins() {
        let probes: Vec<Box<dyn PartitionProbe>> = vec![
            Box::new(FixedProbe(Err("sfdisk: not found"))),
            Box::new(FixedProbe(Ok(vec![entry(1, 512, 100)]))),
            Box::new(FixedProbe(Ok(vec![entry(1, 512, 100), entry(2, 1024, 64)]))),
            Box::new(FixedProbe(Ok(vec![entry(2, 9999, 1)]))),
        ];
        let r = locate_rootfs_partition(&probes, Utf8Path::new("fw.img")).unwrap();
        assert_eq!(
            r,
            RootfsPartition {
                offset: 1024 * 512,
                size: 64 * 512
            }
        );
    }

    #[test]
    fn test_no_rootfs_is_fatal() {
        let probes: Vec<Box<dyn PartitionProbe>> = vec![
            Box::new(FixedProbe(Err("broken"))),
            Box::new(FixedProbe(Ok(vec![entry(1, 512, 100)]))),
        ];
        let e = locate_rootfs_partition(&probes, Utf8Path::new("fw.img")).unwrap_err();
        assert!(matches!(e, UpgradeError::NoRootfsPartition { .. }));
        assert_eq!(e.severity(), crate::error::Severity::AbortUpgrade);
    }

    #[test]
    fn test_out_of_range_partition_is_never_used() {
        let huge = entry(2, 1 << 55, 64);
        assert!(RootfsPartition::try_from(&huge).is_err());
        let probes: Vec<Box<dyn PartitionProbe>> =
            vec![Box::new(FixedProbe(Ok(vec![entry(1, 512, 100), huge])))];
        let e = locate_rootfs_partition(&probes, Utf8Path::new("fw.img")).unwrap_err();
        assert!(matches!(e, UpgradeError::NoRootfsPartition { .. }));
        // A later probe reporting a sane table still wins
        let probes: Vec<Box<dyn PartitionProbe>> = vec![
            Box::new(FixedProbe(Ok(vec![huge]))),
            Box::new(FixedProbe(Ok(vec![entry(2, 1024, 64)]))),
        ];
        let r = locate_rootfs_partition(&probes, Utf8Path::new("fw.img")).unwrap();
        assert_eq!(r.offset, 1024 * 512);
    }

    #[test]
    fn test_native_map_probe() -> Result<()> {
        let td = tempfile::tempdir()?;
        let td = Utf8Path::from_path(td.path()).unwrap();
        let helper = td.join("common.sh");
        let map = td.join("partmap.image");
        std::fs::write(
            &helper,
            format!(
                "get_partitions() {{\n  printf ' 1   512   100\\n 2  1024    64\\n' > {map}\n}}\n"
            ),
        )?;
        let probe = NativeMapProbe::new(&helper, &map);
        let entries = probe.partitions(Utf8Path::new("fw.img"))?;
        assert_eq!(entries, vec![entry(1, 512, 100), entry(2, 1024, 64)]);
        // Scratch map is gone
        assert!(!map.exists());
        Ok(())
    }

    #[test]
    fn test_native_map_probe_missing_helper() {
        let probe = NativeMapProbe::new("/nonexistent/common.sh", "/nonexistent/partmap");
        assert!(probe.partitions(Utf8Path::new("fw.img")).is_err());
    }
}
