//! The persistent firmware store.
//!
//! Images are copied out of ephemeral storage into a directory which
//! survives a container restart. Nothing here is ever garbage collected.

use std::io::Read;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::layout::{
    open_parent, relative, CONFIG_BACKUP_PERSISTED, CONFIG_BACKUP_SOURCE, STORE_DIR,
};

const IMAGE_PREFIX: &str = "firmware_";
const IMAGE_SUFFIX: &str = ".img";

/// The timestamp format used in persisted names.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn unique_name(dir: &Dir, ts: &str) -> Result<String> {
    let mut name = format!("{IMAGE_PREFIX}{ts}{IMAGE_SUFFIX}");
    let mut n = 1u32;
    while dir.try_exists(&name)? {
        name = format!("{IMAGE_PREFIX}{ts}_{n}{IMAGE_SUFFIX}");
        n += 1;
    }
    Ok(name)
}

/// Copy the firmware image into the store, returning its absolute device path.
/// The copy is written under a temporary name and renamed into place, so
/// the store never holds a partial image.
#[context("Persisting {image}")]
pub fn persist_image(root: &Dir, image: &Utf8Path, ts: &str) -> Result<Utf8PathBuf> {
    let mut src = std::fs::File::open(image).with_context(|| format!("Opening {image}"))?;
    root.create_dir_all(STORE_DIR)?;
    let dir = root.open_dir(STORE_DIR)?;
    let name = unique_name(&dir, ts)?;
    dir.atomic_replace_with(&name, |w| std::io::copy(&mut src, w))
        .context("Copying image")?;
    Ok(Utf8Path::new("/").join(STORE_DIR).join(name))
}

/// Copy the configuration backup left by the native tooling, if any, next
/// to the persisted image. If there is none, a copy left by an earlier
/// attempt is removed. Returns whether a backup was persisted.
#[context("Persisting configuration backup")]
pub fn persist_config_backup(root: &Dir) -> Result<bool> {
    let (dir, name) = open_parent(root, Utf8Path::new(CONFIG_BACKUP_PERSISTED))?;
    let Some(mut src) = root.open_optional(CONFIG_BACKUP_SOURCE)? else {
        if dir.remove_file_optional(name)? {
            tracing::debug!("Removed stale {CONFIG_BACKUP_PERSISTED}");
        }
        return Ok(false);
    };
    dir.atomic_replace_with(name, |w| std::io::copy(&mut src, w))?;
    Ok(true)
}

/// Remove a persisted image again; used when a later step of the same
/// attempt fails, so no unreferenced image is left behind.
pub fn discard_image(root: &Dir, image: &Utf8Path) -> Result<()> {
    root.remove_file_optional(relative(image))
        .with_context(|| format!("Removing {image}"))?;
    Ok(())
}

/// A firmware image in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistedImage {
    /// Absolute device path
    pub path: Utf8PathBuf,
    /// Size in bytes
    pub size: u64,
}

/// All persisted images, oldest first.
#[context("Listing {STORE_DIR}")]
pub fn list_persisted(root: &Dir) -> Result<Vec<PersistedImage>> {
    let Some(dir) = root.open_dir_optional(STORE_DIR)? else {
        return Ok(Vec::new());
    };
    let mut r = Vec::new();
    for ent in dir.entries()? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !(name.starts_with(IMAGE_PREFIX) && name.ends_with(IMAGE_SUFFIX)) {
            continue;
        }
        let meta = ent.metadata()?;
        if !meta.is_file() {
            continue;
        }
        r.push(PersistedImage {
            path: Utf8Path::new("/").join(STORE_DIR).join(name),
            size: meta.len(),
        });
    }
    r.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(r)
}

/// Read the whole of a (small) file below the root, if it exists.
pub(crate) fn read_optional(root: &Dir, path: &Utf8Path) -> Result<Option<Vec<u8>>> {
    let Some(mut f) = root.open_optional(relative(path))? else {
        return Ok(None);
    };
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)
        .with_context(|| format!("Reading {path}"))?;
    Ok(Some(buf))
}
