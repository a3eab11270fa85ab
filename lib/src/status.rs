//! The `status` command: what the upgrade pipeline has queued and kept.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use serde::Serialize;

use crate::layout::Layout;
use crate::marker::peek_marker;
use crate::snapshot::{list_snapshots, SnapshotInfo};
use crate::store::{list_persisted, PersistedImage};

/// State of the upgrade pipeline on this device.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    /// The image queued for the next boot
    pub pending: Option<Utf8PathBuf>,
    /// Whether the queued image still exists
    pub pending_image_present: bool,
    /// All persisted images
    pub images: Vec<PersistedImage>,
    /// All rootfs snapshots
    pub snapshots: Vec<SnapshotInfo>,
}

/// Gather the status of the layout.
pub fn get_status(layout: &Layout) -> Result<UpgradeStatus> {
    let root = layout.open_root()?;
    let pending = peek_marker(&root)?;
    let pending_image_present = pending
        .as_ref()
        .is_some_and(|p| !p.as_str().is_empty() && layout.path(p).is_file());
    Ok(UpgradeStatus {
        pending,
        pending_image_present,
        images: list_persisted(&root)?,
        snapshots: list_snapshots(&root)?,
    })
}

/// Implementation of the `status` CLI command.
pub(crate) fn status(layout: &Layout, json: bool) -> Result<()> {
    let status = get_status(layout)?;
    let out = std::io::stdout();
    let mut out = out.lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &status).context("Writing to stdout")?;
    } else {
        serde_yaml::to_writer(&mut out, &status).context("Writing to stdout")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::layout::{MARKER, STORE_DIR};
    use camino::Utf8Path;

    #[test]
    fn test_status() -> Result<()> {
        let td = tempfile::tempdir()?;
        let layout = Layout::new(
            Utf8Path::from_path(td.path()).unwrap(),
            Configuration::default(),
        );
        let s = get_status(&layout)?;
        assert_eq!(s.pending, None);
        assert!(!s.pending_image_present);
        assert!(s.images.is_empty());

        std::fs::create_dir_all(layout.path(STORE_DIR))?;
        std::fs::write(layout.path(STORE_DIR).join("firmware_1.img"), "x")?;
        std::fs::write(layout.path(STORE_DIR).join("unrelated"), "x")?;
        std::fs::create_dir_all(layout.path("boot"))?;
        std::fs::write(layout.path(MARKER), "/firmware/pending/firmware_1.img\n")?;
        let s = get_status(&layout)?;
        assert_eq!(
            s.pending.as_deref(),
            Some(Utf8Path::new("/firmware/pending/firmware_1.img"))
        );
        assert!(s.pending_image_present);
        assert_eq!(s.images.len(), 1);
        let v = serde_json::to_value(&s)?;
        assert_eq!(v["pendingImagePresent"], serde_json::Value::Bool(true));
        Ok(())
    }
}
