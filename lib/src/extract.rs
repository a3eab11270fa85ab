//! Extracting the new root filesystem from a firmware image.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::debuglog::DebugLog;
use crate::error::UpgradeError;
use crate::partition::RootfsPartition;
use crate::task::Task;

/// A way of unpacking the squashfs rootfs partition of an image.
pub trait RootfsExtractor: std::fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Unpack the partition into `dest`, which exists and is empty.
    fn extract(&self, image: &Utf8Path, rootfs: &RootfsPartition, dest: &Utf8Path) -> Result<()>;
}

/// Unpacks directly from the image with `unsquashfs -o <offset>`; needs
/// neither privileges nor loop devices.
#[derive(Debug, Default)]
pub struct UnsquashfsExtractor;

impl RootfsExtractor for UnsquashfsExtractor {
    fn name(&self) -> &'static str {
        "unsquashfs"
    }

    fn extract(&self, image: &Utf8Path, rootfs: &RootfsPartition, dest: &Utf8Path) -> Result<()> {
        Task::new("Extracting rootfs with unsquashfs", "unsquashfs")
            .args(["-f", "-d", dest.as_str(), "-o"])
            .args([rootfs.offset.to_string().as_str(), image.as_str()])
            .run()
    }
}

/// Loop-mounts the partition region read-only and copies its contents out.
#[derive(Debug, Default)]
pub struct LoopMountExtractor;

impl RootfsExtractor for LoopMountExtractor {
    fn name(&self) -> &'static str {
        "loop-mount"
    }

    fn extract(&self, image: &Utf8Path, rootfs: &RootfsPartition, dest: &Utf8Path) -> Result<()> {
        let mnt = tempfile::Builder::new()
            .prefix("cpe-upgrade-rootfs")
            .tempdir()?;
        let mnt = Utf8PathBuf::try_from(mnt.path().to_path_buf())?;
        let opts = format!(
            "loop,ro,offset={},sizelimit={}",
            rootfs.offset, rootfs.size
        );
        Task::new("Mounting rootfs partition", "mount")
            .args(["-t", "squashfs", "-o", opts.as_str()])
            .args([image.as_str(), mnt.as_str()])
            .run()?;
        let r = Task::new("Copying rootfs", "cp")
            .args(["-a", mnt.join(".").as_str(), format!("{dest}/").as_str()])
            .run();
        // Unmount even if the copy failed
        let u = Task::new("Unmounting rootfs partition", "umount")
            .quiet()
            .args([mnt.as_str()])
            .run();
        r.and(u)
    }
}

/// The extractors used in production, in order of preference.
pub fn default_extractors() -> Vec<Box<dyn RootfsExtractor>> {
    vec![Box::new(UnsquashfsExtractor), Box::new(LoopMountExtractor)]
}

fn reset_dir(d: &Utf8Path) -> Result<()> {
    remove_dir_optional(d)?;
    std::fs::create_dir_all(d).with_context(|| format!("Creating {d}"))
}

pub(crate) fn remove_dir_optional(d: &Utf8Path) -> Result<()> {
    match std::fs::remove_dir_all(d) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            Err(e).with_context(|| format!("Removing {d}"))
        }
        _ => Ok(()),
    }
}

fn is_empty_dir(d: &Utf8Path) -> Result<bool> {
    Ok(d.read_dir_utf8()
        .with_context(|| format!("Reading {d}"))?
        .next()
        .is_none())
}

/// Extract the rootfs into `scratch` using the first extractor that
/// produces a non-empty tree. Returns the name of that extractor.
pub fn extract_rootfs(
    extractors: &[Box<dyn RootfsExtractor>],
    image: &Utf8Path,
    rootfs: &RootfsPartition,
    scratch: &Utf8Path,
    log: &DebugLog,
) -> Result<&'static str, UpgradeError> {
    for extractor in extractors {
        let name = extractor.name();
        let r = reset_dir(scratch)
            .and_then(|_| extractor.extract(image, rootfs, scratch))
            .and_then(|_| {
                anyhow::ensure!(!is_empty_dir(scratch)?, "Extraction produced no files");
                Ok(())
            });
        match r {
            Ok(()) => {
                log.info(format!("Extracted rootfs using {name}"));
                return Ok(name);
            }
            Err(e) => log.warn(format!("Extraction using {name} failed: {e:#}")),
        }
    }
    if let Err(e) = remove_dir_optional(scratch) {
        log.warn(format!("{e:#}"));
    }
    Err(UpgradeError::Extraction {
        path: image.to_owned(),
    })
}
