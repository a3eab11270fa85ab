//! Replacing the live root filesystem with an extracted one.

use std::fmt::Display;
use std::os::unix::fs::{chown, fchown, lchown, MetadataExt, PermissionsExt};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::debuglog::DebugLog;
use crate::error::UpgradeError;
use crate::layout::{Layout, APPLY_EXCLUDES};
use crate::task::Task;

/// How the new rootfs was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyMethod {
    /// `rsync --delete`; the live tree ends up identical to the new one.
    Mirror,
    /// Recursive copy by path; files absent from the new tree are left in place.
    Copy,
}

impl Display for ApplyMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyMethod::Mirror => f.write_str("mirror"),
            ApplyMethod::Copy => f.write_str("copy"),
        }
    }
}

fn excludes(layout: &Layout) -> Vec<&str> {
    let mut r: Vec<&str> = APPLY_EXCLUDES.to_vec();
    r.extend(layout.config().upgrade.preserve());
    r.into_iter().map(|p| p.trim_matches('/')).collect()
}

fn mirror(src: &Utf8Path, dest: &Utf8Path, excludes: &[&str]) -> Result<()> {
    Task::new("Applying new rootfs with rsync", "rsync")
        .args(["-aH", "--delete"])
        .args(excludes.iter().map(|e| format!("--exclude=/{e}")))
        .args([format!("{src}/"), format!("{dest}/")])
        .run()
}

fn is_excluded(rel: &Utf8Path, excludes: &[&str]) -> bool {
    excludes.iter().any(|e| rel.starts_with(e))
}

/// Remove whatever is at `p` without following it if it is a symlink.
fn remove_any(p: &Utf8Path) -> Result<()> {
    let r = match p.symlink_metadata() {
        Ok(m) if m.is_dir() => std::fs::remove_dir_all(p),
        Ok(_) => std::fs::remove_file(p),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    };
    r.with_context(|| format!("Removing {p}"))
}

fn copy_file(src: &Utf8Path, dest: &Utf8Path, meta: &std::fs::Metadata) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid target {dest}"))?;
    if dest.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
        remove_any(dest)?;
    }
    // Written beside the target and renamed over it; running binaries and
    // mapped libraries keep their old inode.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    let mut f = std::fs::File::open(src).with_context(|| format!("Opening {src}"))?;
    std::io::copy(&mut f, tmp.as_file_mut())?;
    // Ownership first; chown clears setuid bits
    fchown(tmp.as_file(), Some(meta.uid()), Some(meta.gid()))
        .with_context(|| format!("Setting owner of {dest}"))?;
    tmp.as_file()
        .set_permissions(std::fs::Permissions::from_mode(meta.mode()))?;
    tmp.as_file().set_modified(meta.modified()?)?;
    tmp.persist(dest)
        .map_err(|e| e.error)
        .with_context(|| format!("Replacing {dest}"))?;
    Ok(())
}

fn copy_tree_at(
    src_root: &Utf8Path,
    dest_root: &Utf8Path,
    rel: &Utf8Path,
    excludes: &[&str],
) -> Result<()> {
    let src_dir = src_root.join(rel);
    for ent in src_dir
        .read_dir_utf8()
        .with_context(|| format!("Reading {src_dir}"))?
    {
        let ent = ent?;
        let rel = rel.join(ent.file_name());
        if is_excluded(&rel, excludes) {
            tracing::debug!("Skipping excluded {rel}");
            continue;
        }
        let src = src_root.join(&rel);
        let dest = dest_root.join(&rel);
        let meta = src.symlink_metadata()?;
        let ty = meta.file_type();
        if ty.is_dir() {
            if !dest.symlink_metadata().map(|m| m.is_dir()).unwrap_or(false) {
                remove_any(&dest)?;
                std::fs::create_dir(&dest).with_context(|| format!("Creating {dest}"))?;
            }
            chown(&dest, Some(meta.uid()), Some(meta.gid()))
                .with_context(|| format!("Setting owner of {dest}"))?;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(meta.mode()))?;
            copy_tree_at(src_root, dest_root, &rel, excludes)?;
        } else if ty.is_symlink() {
            let target = std::fs::read_link(&src)?;
            remove_any(&dest)?;
            std::os::unix::fs::symlink(&target, &dest)
                .with_context(|| format!("Creating symlink {dest}"))?;
            lchown(&dest, Some(meta.uid()), Some(meta.gid()))
                .with_context(|| format!("Setting owner of {dest}"))?;
        } else if ty.is_file() {
            copy_file(&src, &dest, &meta)?;
        } else {
            tracing::debug!("Skipping special file {rel}");
        }
    }
    Ok(())
}

/// Copy the tree at `src` over `dest` by path. Regular files, directories
/// and symlinks are copied with their owner and mode, and files also with
/// their modification time; symlinks already present in `dest` are
/// replaced, never followed.
///
/// Unlike the mirror, this is lossy: nothing absent from `src` is deleted,
/// hard links are copied as separate files, directory timestamps are not
/// kept, and device nodes, fifos and sockets are skipped.
pub fn copy_tree(src: &Utf8Path, dest: &Utf8Path, excludes: &[&str]) -> Result<()> {
    copy_tree_at(src, dest, Utf8Path::new(""), excludes)
}

/// Overwrite the live rootfs of the layout with the tree at `src`, which
/// must itself be inside an excluded directory.
pub fn apply_rootfs(
    layout: &Layout,
    src: &Utf8Path,
    log: &DebugLog,
) -> Result<ApplyMethod, UpgradeError> {
    let excludes = excludes(layout);
    let dest: Utf8PathBuf = layout.root().to_owned();
    match which::which("rsync") {
        Ok(_) => match mirror(src, &dest, &excludes) {
            Ok(()) => return Ok(ApplyMethod::Mirror),
            Err(e) => log.warn(format!("rsync failed, falling back to copy: {e:#}")),
        },
        Err(_) => log.info("rsync not available; using recursive copy"),
    }
    copy_tree(src, &dest, &excludes)
        .map(|()| ApplyMethod::Copy)
        .map_err(|e| UpgradeError::Apply { source: e.into() })
}
