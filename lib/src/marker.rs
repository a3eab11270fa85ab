//! The pending-upgrade marker.
//!
//! Its existence means an upgrade is queued for the next boot; its content
//! is the absolute path of the persisted firmware image. At most one marker
//! exists, and it is deleted before anything is done with it.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::layout::{fsync_dir, open_parent, MARKER};

/// Queue the given persisted image for the next boot, replacing any
/// previously queued one. Returns the image the replaced marker referenced.
#[context("Writing {MARKER}")]
pub fn write_marker(root: &Dir, image: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let previous = peek_marker(root)?;
    let (dir, name) = open_parent(root, Utf8Path::new(MARKER))?;
    dir.atomic_replace_with(name, |w| -> std::io::Result<()> {
        w.write_all(image.as_str().as_bytes())?;
        w.write_all(b"\n")
    })?;
    fsync_dir(&dir).context("Syncing marker directory")?;
    Ok(previous)
}

fn read_marker(root: &Dir) -> Result<Option<String>> {
    let Some(mut f) = root.open_optional(MARKER)? else {
        return Ok(None);
    };
    let mut buf = String::new();
    f.read_to_string(&mut buf)?;
    Ok(Some(buf))
}

fn parse_marker(buf: &str) -> Option<Utf8PathBuf> {
    let line = buf.lines().next().unwrap_or_default().trim();
    (!line.is_empty()).then(|| Utf8PathBuf::from(line))
}

/// Read the marker without consuming it. `Ok(None)` if no upgrade is
/// queued; an empty marker reads as an empty path.
pub fn peek_marker(root: &Dir) -> Result<Option<Utf8PathBuf>> {
    let Some(buf) = read_marker(root)? else {
        return Ok(None);
    };
    Ok(Some(parse_marker(&buf).unwrap_or_default()))
}

/// The result of consuming the marker.
#[derive(Debug, PartialEq, Eq)]
pub enum Consumed {
    /// There was no marker.
    Absent,
    /// The marker existed but had no content.
    Empty,
    /// The marker referenced this image.
    Image(Utf8PathBuf),
}

/// Read and delete the marker. The removal is synced to disk before this
/// returns, so a crash at any later point cannot cause the same upgrade to
/// be applied twice.
#[context("Consuming {MARKER}")]
pub fn consume_marker(root: &Dir) -> Result<Consumed> {
    let Some(buf) = read_marker(root)? else {
        return Ok(Consumed::Absent);
    };
    let (dir, name) = open_parent(root, Utf8Path::new(MARKER))?;
    dir.remove_file(name).context("Removing marker")?;
    fsync_dir(&dir).context("Syncing marker directory")?;
    Ok(match parse_marker(&buf) {
        Some(p) => Consumed::Image(p),
        None => Consumed::Empty,
    })
}
