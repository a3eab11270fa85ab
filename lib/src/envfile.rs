//! Reconciliation of generated environment files.
//!
//! Several boot scripts append `export VAR="value"` lines to the same file,
//! and a restored configuration brings back lines that are regenerated
//! anyway. A shell sourcing the file sees the last assignment of each
//! variable, so that one is kept and earlier ones are dropped.
//!
//! Like the shell, everything here works on bytes; values need not be UTF-8.

use std::collections::HashMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::layout::{open_parent, Layout, ENVIRONMENT_FILES};
use crate::store::read_optional;

static EXPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*export\s+([A-Za-z_][A-Za-z0-9_]*)=").unwrap());

fn lines(text: &[u8]) -> impl Iterator<Item = &[u8]> {
    text.split_inclusive(|&b| b == b'\n')
}

fn exported_name(line: &[u8]) -> Option<&[u8]> {
    EXPORT_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_bytes())
}

/// Drop every export line that is followed by another export of the same
/// variable. All other lines are kept byte for byte, in order.
pub fn reconcile(text: &[u8]) -> Vec<u8> {
    let lines: Vec<&[u8]> = lines(text).collect();
    let mut last: HashMap<&[u8], usize> = HashMap::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(name) = exported_name(line) {
            last.insert(name, i);
        }
    }
    lines
        .iter()
        .enumerate()
        .filter(|(i, line)| match exported_name(line) {
            Some(name) => last.get(name) == Some(i),
            None => true,
        })
        .map(|(_, line)| *line)
        .collect::<Vec<_>>()
        .concat()
}

fn trim(mut v: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = v {
        if !first.is_ascii_whitespace() {
            break;
        }
        v = rest;
    }
    while let [rest @ .., last] = v {
        if !last.is_ascii_whitespace() {
            break;
        }
        v = rest;
    }
    v
}

fn unquote(v: &[u8]) -> &[u8] {
    for q in [b'"', b'\''] {
        if let Some(inner) = v.strip_prefix(&[q]).and_then(|v| v.strip_suffix(&[q])) {
            return inner;
        }
    }
    v
}

/// The value of the last export of `name`, without surrounding quotes.
pub fn lookup(text: &[u8], name: &str) -> Option<Vec<u8>> {
    lines(text)
        .filter_map(|line| {
            let m = EXPORT_RE.captures(line)?;
            if m.get(1)?.as_bytes() != name.as_bytes() {
                return None;
            }
            let value = trim(&line[m.get(0)?.end()..]);
            Some(unquote(value).to_vec())
        })
        .last()
}

/// Set `name` to `value`: the first export of the variable is replaced,
/// later ones are dropped, and if there is none a line is appended.
pub fn upsert(text: &[u8], name: &str, value: &str) -> Vec<u8> {
    let assignment = format!("export {name}=\"{value}\"\n");
    let mut r = Vec::with_capacity(text.len() + assignment.len());
    let mut found = false;
    for line in lines(text) {
        if exported_name(line) != Some(name.as_bytes()) {
            r.extend_from_slice(line);
            continue;
        }
        if !found {
            r.extend_from_slice(assignment.as_bytes());
            found = true;
        }
    }
    if !found {
        if !r.is_empty() && !r.ends_with(b"\n") {
            r.push(b'\n');
        }
        r.extend_from_slice(assignment.as_bytes());
    }
    r
}

/// Replace the content of a file below the root if it differs, keeping
/// its permissions. Returns whether the file was changed.
pub(crate) fn replace_if_changed(
    root: &Dir,
    path: &Utf8Path,
    old: &[u8],
    new: &[u8],
) -> Result<bool> {
    if old == new {
        return Ok(false);
    }
    let (dir, name) = open_parent(root, path)?;
    let perms = match dir.metadata_optional(name)? {
        Some(m) => m.permissions(),
        None => Permissions::from_mode(0o644),
    };
    dir.atomic_write_with_perms(name, new, perms)
        .with_context(|| format!("Writing {path}"))?;
    Ok(true)
}

/// Reconcile one environment file below the root. Returns `None` if it
/// does not exist, otherwise whether it was rewritten.
#[context("Reconciling {path}")]
pub fn reconcile_file(root: &Dir, path: &Utf8Path) -> Result<Option<bool>> {
    let Some(old) = read_optional(root, path)? else {
        return Ok(None);
    };
    let new = reconcile(&old);
    replace_if_changed(root, path, &old, &new).map(Some)
}

/// Reconcile the given files, or the standard environment files if none
/// are given. Missing files are skipped; returns the files that were
/// rewritten.
pub fn reconcile_all(layout: &Layout, files: &[Utf8PathBuf]) -> Result<Vec<Utf8PathBuf>> {
    let root = layout.open_root()?;
    let files: Vec<&Utf8Path> = if files.is_empty() {
        ENVIRONMENT_FILES.iter().map(Utf8Path::new).collect()
    } else {
        files.iter().map(|p| crate::layout::relative(p)).collect()
    };
    let mut changed = Vec::new();
    for path in files {
        match reconcile_file(&root, path)? {
            Some(true) => {
                tracing::info!("Removed duplicate assignments from /{path}");
                changed.push(path.to_owned());
            }
            Some(false) => tracing::debug!("/{path}: no duplicates"),
            None => tracing::debug!("/{path}: not present"),
        }
    }
    Ok(changed)
}
