//! Well-known locations shared by the live-session and boot-time halves
//! of the upgrade pipeline.
//!
//! All paths here are relative to the root of the device filesystem; a
//! [`Layout`] resolves them against the actual root, which is `/` in
//! production.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::config::Configuration;

/// Existence means an upgrade is queued; the content is the persisted image path.
pub const MARKER: &str = "boot/.do_upgrade";
/// Persisted firmware images.
pub const STORE_DIR: &str = "firmware/pending";
/// Rootfs snapshots taken before an upgrade is applied.
pub const BACKUPS_DIR: &str = "firmware/backups";
/// Scratch directory the new rootfs is extracted into.
pub const SCRATCH_DIR: &str = "firmware/.extract";
/// Where the native tooling leaves its configuration backup.
pub const CONFIG_BACKUP_SOURCE: &str = "tmp/sysupgrade.tgz";
/// The copy of the configuration backup that survives a restart.
pub const CONFIG_BACKUP_PERSISTED: &str = "boot/sysupgrade.tgz";
/// Locations probed by the native config restoration at boot.
pub const CONFIG_RESTORE_TARGETS: &[&str] = &["sysupgrade.tgz", "tmp/sysupgrade.tgz"];
/// Debug log of the boot-time entrypoint.
pub const ENTRYPOINT_LOG: &str = "boot/entrypoint-debug.log";
/// Debug log of the live-session upgrade hooks.
pub const UPGRADE_LOG: &str = "boot/container-upgrade-debug.log";
/// Environment files generated at boot; the first one is authoritative.
pub const ENVIRONMENT_FILES: &[&str] = &["var/etc/environment", "etc/environment"];
/// Network interfaces as exposed by sysfs.
pub const SYSFS_NET: &str = "sys/class/net";
/// Written by the native `get_partitions` helper.
pub const PARTITION_MAP: &str = "tmp/partmap.image";
/// Top-level paths that applying a new rootfs never touches.
pub const APPLY_EXCLUDES: &[&str] = &[
    "proc",
    "sys",
    "dev",
    "tmp",
    "run",
    "boot",
    "firmware",
    "sysupgrade.tgz",
];

/// The device filesystem as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct Layout {
    root: Utf8PathBuf,
    config: Configuration,
}

impl Layout {
    /// Create a layout rooted at the given directory.
    pub fn new(root: impl Into<Utf8PathBuf>, config: Configuration) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    /// The layout of the running system, with configuration loaded from
    /// the standard locations.
    pub fn system() -> Result<Self> {
        let config = crate::config::load_config()?;
        Ok(Self::new("/", config))
    }

    /// The root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The effective configuration.
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Resolve a device path (absolute or root-relative) under the root.
    pub fn path(&self, p: impl AsRef<Utf8Path>) -> Utf8PathBuf {
        self.root.join(relative(p.as_ref()))
    }

    /// Open the root as a directory handle.
    pub fn open_root(&self) -> Result<Dir> {
        Dir::open_ambient_dir(&self.root, cap_std::ambient_authority())
            .with_context(|| format!("Opening root {}", self.root))
    }
}

/// A device path made relative to the root, for use with a [`Dir`] of it.
pub(crate) fn relative(p: &Utf8Path) -> &Utf8Path {
    p.strip_prefix("/").unwrap_or(p)
}

/// Split a root-relative path into its (created if needed) parent directory
/// and file name, for use with the atomic replacement helpers.
pub(crate) fn open_parent<'p>(root: &Dir, path: &'p Utf8Path) -> Result<(Dir, &'p str)> {
    let name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid path {path}"))?;
    let parent = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => return Ok((root.try_clone()?, name)),
    };
    root.create_dir_all(parent)
        .with_context(|| format!("Creating {parent}"))?;
    let dir = root
        .open_dir(parent)
        .with_context(|| format!("Opening {parent}"))?;
    Ok((dir, name))
}

/// Make entry changes in `dir` (creations, renames, removals) durable.
pub(crate) fn fsync_dir(dir: &Dir) -> Result<()> {
    // Can't call fsync on O_PATH fds, so re-open it as a non O_PATH fd
    let fd = dir.reopen_as_ownedfd().context("Reopening directory")?;
    rustix::fs::fsync(fd).context("Syncing directory")?;
    Ok(())
}
