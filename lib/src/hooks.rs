//! Interception of the native upgrade tooling.
//!
//! The native tool calls three platform hooks while applying a firmware
//! image. In a container there is no flash to write and no root to switch
//! away from, so [`ContainerHooks`] validates the image and queues it in
//! the persistent store for the next boot instead. The live root
//! filesystem is never modified here.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::debuglog::DebugLog;
use crate::error::UpgradeError;
use crate::layout::{Layout, UPGRADE_LOG};
use crate::partition::{
    default_probes, locate_rootfs_partition, PartitionProbe, RootfsPartition,
};
use crate::{marker, store};

/// The platform hooks of the native upgrade tooling.
pub trait NativeUpgradeHooks: std::fmt::Debug {
    /// Whether the image can be applied on this platform.
    fn image_is_valid(&self, image: &Utf8Path) -> bool;

    /// Whether switching to a RAM-backed root before applying must be skipped.
    fn skip_ramfs_switch(&self) -> bool;

    /// Apply (or, here, queue) the image.
    fn commit_upgrade(&self, image: &Utf8Path) -> Result<CommittedUpgrade, UpgradeError>;
}

/// An upgrade queued for the next boot.
#[derive(Debug, Clone, Serialize)]
pub struct CommittedUpgrade {
    /// The image as found in the live session
    pub source: Utf8PathBuf,
    /// Where it was persisted; this is what the marker references
    pub persisted: Utf8PathBuf,
    /// Location of the rootfs inside the image
    pub rootfs: RootfsPartition,
    /// Whether a configuration backup was persisted alongside
    pub config_backup: bool,
    /// A previously queued image which this one replaced
    pub replaced: Option<Utf8PathBuf>,
}

/// Hooks for a device running as a container.
#[derive(Debug)]
pub struct ContainerHooks {
    layout: Layout,
    probes: Vec<Box<dyn PartitionProbe>>,
    log: DebugLog,
}

fn check_readable(path: &Utf8Path) -> Result<bool, UpgradeError> {
    match std::fs::metadata(path) {
        Ok(m) if m.is_file() => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(UpgradeError::ImageUnreadable {
                path: path.to_owned(),
                source,
            })
        }
    }
    std::fs::File::open(path)
        .map(|_| true)
        .map_err(|source| UpgradeError::ImageUnreadable {
            path: path.to_owned(),
            source,
        })
}

impl ContainerHooks {
    /// Hooks operating on the given layout, using the default partition probes.
    pub fn new(layout: Layout) -> Self {
        let probes = default_probes(&layout);
        let log = DebugLog::new(layout.path(UPGRADE_LOG));
        Self { layout, probes, log }
    }

    /// Replace the partition probes.
    pub fn with_probes(mut self, probes: Vec<Box<dyn PartitionProbe>>) -> Self {
        self.probes = probes;
        self
    }

    /// The persistent log of this hook set.
    pub fn log(&self) -> &DebugLog {
        &self.log
    }

    /// Find the image, looking in the configured fallback locations if it
    /// is not at the given path.
    fn resolve_image(&self, image: &Utf8Path) -> Result<Utf8PathBuf, UpgradeError> {
        if check_readable(image)? {
            return Ok(image.to_owned());
        }
        for candidate in self.layout.config().upgrade.fallback_images() {
            let candidate = self.layout.path(candidate);
            if check_readable(&candidate)? {
                self.log
                    .info(format!("Image not found at {image}; using {candidate}"));
                return Ok(candidate);
            }
        }
        Err(UpgradeError::ImageNotFound {
            path: image.to_owned(),
        })
    }

    fn commit_impl(&self, image: &Utf8Path) -> Result<CommittedUpgrade, UpgradeError> {
        let source = self.resolve_image(image)?;
        let rootfs = locate_rootfs_partition(&self.probes, &source)?;
        self.log.info(format!("Found rootfs partition at {rootfs}"));

        let root = self
            .layout
            .open_root()
            .map_err(|e| UpgradeError::Persist { source: e.into() })?;
        let persisted = store::persist_image(&root, &source, &store::timestamp_now())
            .map_err(|e| UpgradeError::Persist { source: e.into() })?;
        self.log.info(format!("Persisted image to {persisted}"));

        let discard = |e: anyhow::Error| {
            if let Err(e) = store::discard_image(&root, &persisted) {
                self.log.warn(format!("{e:#}"));
            }
            e
        };
        let config_backup = store::persist_config_backup(&root)
            .map_err(discard)
            .map_err(|e| UpgradeError::Persist { source: e.into() })?;
        if config_backup {
            self.log.info("Persisted configuration backup");
        }

        let replaced = marker::write_marker(&root, &persisted)
            .map_err(discard)
            .map_err(|e| UpgradeError::MarkerWrite { source: e.into() })?;
        if let Some(prev) = replaced.as_ref() {
            self.log
                .info(format!("Replaced previously queued upgrade of {prev}"));
        }
        Ok(CommittedUpgrade {
            source,
            persisted,
            rootfs,
            config_backup,
            replaced,
        })
    }
}

impl NativeUpgradeHooks for ContainerHooks {
    fn image_is_valid(&self, image: &Utf8Path) -> bool {
        let r = check_readable(image).and_then(|found| {
            if !found {
                return Err(UpgradeError::ImageNotFound {
                    path: image.to_owned(),
                });
            }
            locate_rootfs_partition(&self.probes, image)
        });
        match r {
            Ok(rootfs) => {
                self.log
                    .info(format!("Image {image} is valid; rootfs at {rootfs}"));
                true
            }
            Err(e) => {
                self.log.warn(format!("Image is not valid: {}", e.chain()));
                false
            }
        }
    }

    fn skip_ramfs_switch(&self) -> bool {
        // Nothing to unmount, and pivoting may not be permitted in a container
        true
    }

    fn commit_upgrade(&self, image: &Utf8Path) -> Result<CommittedUpgrade, UpgradeError> {
        self.log.info(format!("Container upgrade requested for {image}"));
        match self.commit_impl(image) {
            Ok(r) => {
                self.log.info(format!(
                    "Upgrade queued for next boot; marker references {}",
                    r.persisted
                ));
                Ok(r)
            }
            Err(e) => {
                self.log.warn(format!("Upgrade aborted: {}", e.chain()));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::layout::{MARKER, STORE_DIR};
    use cpe_upgrade_blockdev::PartitionEntry;

    #[derive(Debug)]
    struct Fixed(Vec<PartitionEntry>);

    impl PartitionProbe for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn partitions(&self, _image: &Utf8Path) -> Result<Vec<PartitionEntry>> {
            Ok(self.0.clone())
        }
    }

    fn two_partitions() -> Vec<Box<dyn PartitionProbe>> {
        vec![Box::new(Fixed(vec![
            PartitionEntry {
                number: 1,
                start: 512,
                size: 100,
            },
            PartitionEntry {
                number: 2,
                start: 1024,
                size: 64,
            },
        ]))]
    }

    fn setup() -> Result<(tempfile::TempDir, Layout)> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        std::fs::create_dir_all(root.join("tmp"))?;
        Ok((td, Layout::new(root, Configuration::default())))
    }

    #[test]
    fn test_skip_ramfs_switch() -> Result<()> {
        let (_td, layout) = setup()?;
        assert!(ContainerHooks::new(layout).skip_ramfs_switch());
        Ok(())
    }

    #[test]
    fn test_image_validity() -> Result<()> {
        let (_td, layout) = setup()?;
        let image = layout.path("tmp/fw.img");
        std::fs::write(&image, b"fw")?;
        let hooks = ContainerHooks::new(layout.clone()).with_probes(two_partitions());
        assert!(hooks.image_is_valid(&image));
        assert!(!hooks.image_is_valid(&layout.path("tmp/missing.img")));
        let hooks = ContainerHooks::new(layout.clone()).with_probes(vec![]);
        assert!(!hooks.image_is_valid(&image));
        assert!(layout.path(UPGRADE_LOG).exists());
        Ok(())
    }

    #[test]
    fn test_commit_uses_fallback_location() -> Result<()> {
        let (_td, layout) = setup()?;
        std::fs::write(layout.path("/tmp/firmware.img"), b"fw")?;
        let hooks = ContainerHooks::new(layout.clone()).with_probes(two_partitions());
        let r = hooks.commit_upgrade(&layout.path("/nonexistent/fw.img"))?;
        assert_eq!(r.source, layout.path("/tmp/firmware.img"));
        assert!(r.persisted.starts_with("/firmware/pending"));
        assert!(!r.config_backup);
        assert_eq!(r.replaced, None);
        assert_eq!(
            std::fs::read_to_string(layout.path(MARKER))?.trim(),
            r.persisted.as_str()
        );
        Ok(())
    }

    #[test]
    fn test_commit_missing_image() -> Result<()> {
        let (_td, layout) = setup()?;
        let hooks = ContainerHooks::new(layout.clone()).with_probes(two_partitions());
        let e = hooks
            .commit_upgrade(&layout.path("/nonexistent/fw.img"))
            .unwrap_err();
        assert!(matches!(e, UpgradeError::ImageNotFound { .. }));
        assert!(!layout.path(MARKER).exists());
        assert!(!layout.path(STORE_DIR).exists());
        Ok(())
    }
}
