//! Snapshots of the live rootfs, taken before an upgrade replaces it.
//!
//! A snapshot is a squashfs image plus a small `key=value` sidecar. They
//! exist for manual rollback only and nothing here restores them.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::layout::{Layout, BACKUPS_DIR};
use crate::task::Task;

const SNAPSHOT_PREFIX: &str = "rootfs_backup_";
const INFO_SUFFIX: &str = ".info";

/// The sidecar of a rootfs snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    /// When the snapshot was taken
    pub timestamp: String,
    /// The image whose application triggered the snapshot
    pub source_image: Utf8PathBuf,
    /// The squashfs snapshot itself
    pub snapshot: Utf8PathBuf,
}

impl SnapshotInfo {
    /// Serialize as sidecar text.
    pub fn to_text(&self) -> String {
        format!(
            "timestamp={}\nsource_image={}\nsnapshot={}\n",
            self.timestamp, self.source_image, self.snapshot
        )
    }

    /// Parse sidecar text; unknown keys are ignored.
    pub fn parse(buf: &str) -> Result<Self> {
        let mut timestamp = None;
        let mut source_image: Option<Utf8PathBuf> = None;
        let mut snapshot: Option<Utf8PathBuf> = None;
        for line in buf.lines() {
            let Some((k, v)) = line.split_once('=') else {
                continue;
            };
            let v = v.trim().to_owned();
            match k.trim() {
                "timestamp" => timestamp = Some(v),
                "source_image" => source_image = Some(v.into()),
                "snapshot" => snapshot = Some(v.into()),
                _ => {}
            }
        }
        Ok(Self {
            timestamp: timestamp.ok_or_else(|| anyhow::anyhow!("Missing timestamp"))?,
            source_image: source_image.ok_or_else(|| anyhow::anyhow!("Missing source_image"))?,
            snapshot: snapshot.ok_or_else(|| anyhow::anyhow!("Missing snapshot"))?,
        })
    }
}

/// Pack the configured top-level directories of the live rootfs into
/// `rootfs_backup_<ts>.img` and write its sidecar.
#[context("Creating rootfs snapshot")]
pub fn create_snapshot(
    layout: &Layout,
    source_image: &Utf8Path,
    ts: &str,
) -> Result<SnapshotInfo> {
    let sources: Vec<Utf8PathBuf> = layout
        .config()
        .upgrade
        .snapshot_dirs()
        .into_iter()
        .map(|d| layout.path(d))
        .filter(|p| p.is_dir())
        .collect();
    anyhow::ensure!(!sources.is_empty(), "No directories to snapshot");

    let root = layout.open_root()?;
    root.create_dir_all(BACKUPS_DIR)
        .with_context(|| format!("Creating {BACKUPS_DIR}"))?;
    let name = format!("{SNAPSHOT_PREFIX}{ts}.img");
    let target = layout.path(BACKUPS_DIR).join(&name);
    Task::new("Snapshotting current rootfs", "mksquashfs")
        .args(sources.iter().map(|p| p.as_str()))
        // A lone source directory keeps its name instead of becoming the root
        .args([
            target.as_str(),
            "-noappend",
            "-no-progress",
            "-keep-as-directory",
        ])
        .run()?;

    let info = SnapshotInfo {
        timestamp: ts.to_owned(),
        source_image: source_image.to_owned(),
        snapshot: Utf8Path::new("/").join(BACKUPS_DIR).join(name),
    };
    let backups = root.open_dir(BACKUPS_DIR)?;
    backups
        .atomic_write(format!("{SNAPSHOT_PREFIX}{ts}{INFO_SUFFIX}"), info.to_text())
        .context("Writing sidecar")?;
    Ok(info)
}

/// All snapshots with a readable sidecar, oldest first.
#[context("Listing {BACKUPS_DIR}")]
pub fn list_snapshots(root: &Dir) -> Result<Vec<SnapshotInfo>> {
    let Some(dir) = root.open_dir_optional(BACKUPS_DIR)? else {
        return Ok(Vec::new());
    };
    let mut names = Vec::new();
    for ent in dir.entries()? {
        let ent = ent?;
        if let Some(name) = ent.file_name().to_str() {
            if name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(INFO_SUFFIX) {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    let mut r = Vec::new();
    for name in names {
        let buf = dir.read_to_string(&name)?;
        match SnapshotInfo::parse(&buf) {
            Ok(info) => r.push(info),
            Err(e) => tracing::warn!("Ignoring {name}: {e}"),
        }
    }
    Ok(r)
}
