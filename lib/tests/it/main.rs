//! End-to-end scenarios over a scratch device root: an upgrade is queued
//! through the hooks, then applied by the boot-time entrypoint.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cpe_upgrade_blockdev::PartitionEntry;
use cpe_upgrade_lib::boot::{BootApplier, BootOutcome};
use cpe_upgrade_lib::config::Configuration;
use cpe_upgrade_lib::envfile::reconcile_all;
use cpe_upgrade_lib::error::{Severity, UpgradeError};
use cpe_upgrade_lib::extract::{default_extractors, extract_rootfs, RootfsExtractor};
use cpe_upgrade_lib::hooks::{ContainerHooks, NativeUpgradeHooks};
use cpe_upgrade_lib::layout::{Layout, MARKER, SCRATCH_DIR, STORE_DIR};
use cpe_upgrade_lib::marker::write_marker;
use cpe_upgrade_lib::partition::{
    locate_rootfs_partition, NativeMapProbe, PartitionProbe, RootfsPartition, SfdiskProbe,
};
use cpe_upgrade_lib::store::list_persisted;
use cpe_upgrade_lib::DebugLog;

#[derive(Debug)]
struct FixedProbe(Vec<PartitionEntry>);

impl PartitionProbe for FixedProbe {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn partitions(&self, _image: &Utf8Path) -> Result<Vec<PartitionEntry>> {
        Ok(self.0.clone())
    }
}

fn probes(with_rootfs: bool) -> Vec<Box<dyn PartitionProbe>> {
    let mut parts = vec![PartitionEntry {
        number: 1,
        start: 2048,
        size: 2048,
    }];
    if with_rootfs {
        parts.push(PartitionEntry {
            number: 2,
            start: 4096,
            size: 8192,
        });
    }
    vec![Box::new(FixedProbe(parts))]
}

/// Writes a fixed tree instead of reading the image.
#[derive(Debug)]
struct TreeExtractor(&'static [(&'static str, &'static str)]);

impl RootfsExtractor for TreeExtractor {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn extract(&self, _image: &Utf8Path, _rootfs: &RootfsPartition, dest: &Utf8Path) -> Result<()> {
        for (path, content) in self.0 {
            let p = dest.join(path);
            if let Some(parent) = p.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(p, content)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct FailingExtractor;

impl RootfsExtractor for FailingExtractor {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn extract(&self, _: &Utf8Path, _: &RootfsPartition, _: &Utf8Path) -> Result<()> {
        anyhow::bail!("corrupt squashfs")
    }
}

const NEW_ROOTFS: &[(&str, &str)] = &[
    ("etc/banner", "firmware v2\n"),
    ("etc/config/network", "config interface 'wan'\n"),
    ("usr/bin/newtool", "#!/bin/sh\n"),
];

struct Device {
    _td: tempfile::TempDir,
    layout: Layout,
}

impl Device {
    /// A device root running "firmware v1" with upgrade tooling installed.
    fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let layout = Layout::new(root, Configuration::default());
        let d = Self { _td: td, layout };
        d.write("etc/banner", "firmware v1\n")?;
        d.write("usr/sbin/cpe-upgrade", "binary")?;
        d.write("lib/upgrade/container-hooks.sh", "platform_do_upgrade() { :; }\n")?;
        d.write("tmp/fw.img", "firmware image bytes")?;
        std::fs::create_dir_all(d.layout.path("boot"))?;
        Ok(d)
    }

    fn write(&self, path: &str, content: impl AsRef<[u8]>) -> Result<()> {
        let p = self.layout.path(path);
        std::fs::create_dir_all(p.parent().unwrap())?;
        std::fs::write(p, content)?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<String> {
        Ok(std::fs::read_to_string(self.layout.path(path))?)
    }

    fn exists(&self, path: &str) -> bool {
        self.layout.path(path).exists()
    }

    fn root(&self) -> Result<Dir> {
        self.layout.open_root()
    }

    fn image(&self) -> Utf8PathBuf {
        self.layout.path("tmp/fw.img")
    }

    fn hooks(&self, with_rootfs: bool) -> ContainerHooks {
        ContainerHooks::new(self.layout.clone()).with_probes(probes(with_rootfs))
    }

    fn applier(&self, extractor: Box<dyn RootfsExtractor>) -> BootApplier {
        BootApplier::new(self.layout.clone())
            .with_probes(probes(true))
            .with_extractors(vec![extractor])
    }
}

#[test]
fn test_upgrade_happy_path() -> Result<()> {
    let d = Device::new()?;
    let hooks = d.hooks(true);
    assert!(hooks.skip_ramfs_switch());
    assert!(hooks.image_is_valid(&d.image()));
    let committed = hooks.commit_upgrade(&d.image())?;
    assert_eq!(committed.rootfs.offset, 4096 * 512);
    assert!(committed.persisted.starts_with("/firmware/pending"));
    assert_eq!(committed.replaced, None);
    // The live rootfs is untouched until the next boot
    assert_eq!(d.read("etc/banner")?, "firmware v1\n");
    assert_eq!(d.read(MARKER)?.trim(), committed.persisted.as_str());

    // Next boot
    let applier = d.applier(Box::new(TreeExtractor(NEW_ROOTFS)));
    let applied = match applier.run() {
        BootOutcome::Applied(a) => a,
        o => panic!("Expected an applied upgrade, not {o:?}"),
    };
    assert_eq!(applied.image, committed.persisted);
    assert_eq!(applied.extractor, "tree");
    assert!(!applied.config_restored);

    assert_eq!(d.read("etc/banner")?, "firmware v2\n");
    assert_eq!(d.read("usr/bin/newtool")?, "#!/bin/sh\n");
    assert_eq!(d.read("usr/sbin/cpe-upgrade")?, "binary");
    assert!(!d.exists(MARKER));
    assert!(!d.exists(SCRATCH_DIR));
    assert!(!d.exists("lib/upgrade/container-hooks.sh"));
    let log = std::fs::read_to_string(applier.log().path())?;
    assert!(log.contains("completed successfully"), "{log}");

    // And the boot after that is a plain boot
    assert!(matches!(applier.run(), BootOutcome::NoPendingUpgrade));
    Ok(())
}

#[test]
fn test_config_backup_survives_restart() -> Result<()> {
    let d = Device::new()?;
    let backup: &[u8] = b"\x1f\x8b\x08\x00 saved settings";
    d.write("tmp/sysupgrade.tgz", backup)?;
    let committed = d.hooks(true).commit_upgrade(&d.image())?;
    assert!(committed.config_backup);

    // A restart clears the volatile tmp
    std::fs::remove_dir_all(d.layout.path("tmp"))?;

    let applier = d.applier(Box::new(TreeExtractor(NEW_ROOTFS)));
    match applier.run() {
        BootOutcome::Applied(a) => assert!(a.config_restored),
        o => panic!("Expected an applied upgrade, not {o:?}"),
    }
    for target in ["sysupgrade.tgz", "tmp/sysupgrade.tgz"] {
        assert_eq!(std::fs::read(d.layout.path(target))?, backup, "{target}");
    }
    Ok(())
}

#[test]
fn test_missing_rootfs_partition() -> Result<()> {
    let d = Device::new()?;
    let e = d.hooks(false).commit_upgrade(&d.image()).unwrap_err();
    assert!(matches!(e, UpgradeError::NoRootfsPartition { .. }), "{e}");
    assert_eq!(e.severity(), Severity::AbortUpgrade);
    assert!(!d.exists(MARKER));
    assert!(list_persisted(&d.root()?)?.is_empty());
    Ok(())
}

#[test]
fn test_missing_image() -> Result<()> {
    let d = Device::new()?;
    std::fs::remove_file(d.image())?;
    let hooks = d.hooks(true);
    assert!(!hooks.image_is_valid(&d.image()));
    let e = hooks.commit_upgrade(&d.image()).unwrap_err();
    assert!(matches!(e, UpgradeError::ImageNotFound { .. }), "{e}");
    assert!(!d.exists(MARKER));
    assert!(!d.exists(STORE_DIR));
    Ok(())
}

#[test]
fn test_requeue_replaces_pending() -> Result<()> {
    let d = Device::new()?;
    let hooks = d.hooks(true);
    let first = hooks.commit_upgrade(&d.image())?;
    let second = hooks.commit_upgrade(&d.image())?;
    assert_ne!(first.persisted, second.persisted);
    assert_eq!(second.replaced.as_ref(), Some(&first.persisted));
    assert_eq!(d.read(MARKER)?.trim(), second.persisted.as_str());
    Ok(())
}

#[test]
fn test_stale_marker() -> Result<()> {
    let d = Device::new()?;
    write_marker(&d.root()?, Utf8Path::new("/firmware/pending/gone.img"))?;
    let applier = d.applier(Box::new(TreeExtractor(NEW_ROOTFS)));
    match applier.run() {
        BootOutcome::Skipped(e @ UpgradeError::StaleMarker { .. }) => {
            assert_eq!(e.severity(), Severity::SkipBoot)
        }
        o => panic!("Expected a stale marker, not {o:?}"),
    }
    assert!(!d.exists(MARKER));
    assert_eq!(d.read("etc/banner")?, "firmware v1\n");
    let log = std::fs::read_to_string(applier.log().path())?;
    assert!(log.contains("Skipping upgrade"), "{log}");
    Ok(())
}

#[test]
fn test_empty_marker() -> Result<()> {
    let d = Device::new()?;
    d.write(MARKER, "")?;
    let applier = d.applier(Box::new(TreeExtractor(NEW_ROOTFS)));
    assert!(matches!(
        applier.run(),
        BootOutcome::Skipped(UpgradeError::EmptyMarker)
    ));
    assert!(!d.exists(MARKER));
    Ok(())
}

#[test]
fn test_failed_upgrade_is_attempted_once() -> Result<()> {
    let d = Device::new()?;
    d.hooks(true).commit_upgrade(&d.image())?;
    let applier = d.applier(Box::new(FailingExtractor));
    assert!(matches!(
        applier.run(),
        BootOutcome::Skipped(UpgradeError::Extraction { .. })
    ));
    assert!(!d.exists(MARKER));
    assert!(!d.exists(SCRATCH_DIR));
    assert_eq!(d.read("etc/banner")?, "firmware v1\n");
    // Tooling is only removed after a successful upgrade
    assert!(d.exists("lib/upgrade/container-hooks.sh"));
    assert!(matches!(applier.run(), BootOutcome::NoPendingUpgrade));
    Ok(())
}

fn snapshot_tree(root: &Utf8Path) -> Result<Vec<(Utf8PathBuf, Vec<u8>)>> {
    let mut r = Vec::new();
    let mut dirs = vec![root.to_owned()];
    while let Some(dir) = dirs.pop() {
        for ent in dir.read_dir_utf8()? {
            let ent = ent?;
            let p = ent.path().to_owned();
            if ent.file_type()?.is_dir() {
                dirs.push(p.clone());
                r.push((p, Vec::new()));
            } else {
                r.push((p.clone(), std::fs::read(&p)?));
            }
        }
    }
    r.sort();
    Ok(r)
}

#[test]
fn test_plain_boot_changes_nothing() -> Result<()> {
    let d = Device::new()?;
    let before = snapshot_tree(d.layout.root())?;
    let applier = d.applier(Box::new(TreeExtractor(NEW_ROOTFS)));
    assert!(matches!(applier.run(), BootOutcome::NoPendingUpgrade));
    assert_eq!(snapshot_tree(d.layout.root())?, before);
    Ok(())
}

#[test]
fn test_reconcile_environment_after_restore() -> Result<()> {
    let d = Device::new()?;
    d.write(
        "var/etc/environment",
        "export BASEMACADDRESS=\"02:42:ac:11:00:02\"\nexport HOSTNAME=\"cpe\"\nexport BASEMACADDRESS=\"02:42:ac:11:00:03\"\n",
    )?;
    d.write("etc/environment", "export HOSTNAME=\"cpe\"\n")?;
    let changed = reconcile_all(&d.layout, &[])?;
    assert_eq!(changed, ["var/etc/environment"]);
    assert_eq!(
        d.read("var/etc/environment")?,
        "export HOSTNAME=\"cpe\"\nexport BASEMACADDRESS=\"02:42:ac:11:00:03\"\n"
    );
    assert!(reconcile_all(&d.layout, &[])?.is_empty());
    Ok(())
}

/// Write a DOS label with a small boot partition and a rootfs partition of
/// `rootfs_sectors` at sector 4096.
fn partition_image(image: &Utf8Path, rootfs_sectors: u64) -> Result<()> {
    use std::io::Write;
    let mut child = std::process::Command::new("sfdisk")
        .args(["--quiet", image.as_str()])
        .stdin(std::process::Stdio::piped())
        .spawn()?;
    let mut stdin = child.stdin.take().unwrap();
    write!(
        stdin,
        "label: dos\nstart=2048, size=2048, type=c\nstart=4096, size={rootfs_sectors}, type=83\n"
    )?;
    drop(stdin);
    assert!(child.wait()?.success());
    Ok(())
}

#[test]
fn test_partition_probes_agree() -> Result<()> {
    if which::which("sfdisk").is_err() {
        eprintln!("Skipping; sfdisk not available");
        return Ok(());
    }
    let td = tempfile::tempdir()?;
    let image = Utf8Path::from_path(td.path()).unwrap().join("fw.img");
    std::fs::File::create(&image)?.set_len(8 << 20)?;
    partition_image(&image, 8192)?;

    let expected = RootfsPartition {
        offset: 4096 * 512,
        size: 8192 * 512,
    };
    let sfdisk: Vec<Box<dyn PartitionProbe>> = vec![Box::new(SfdiskProbe)];
    assert_eq!(locate_rootfs_partition(&sfdisk, &image)?, expected);

    // A stand-in for the native helper, deriving its map from `sfdisk --dump`
    let dir = image.parent().unwrap();
    let map = dir.join("partmap.image");
    let helper = dir.join("common.sh");
    std::fs::write(
        &helper,
        format!(
            "get_partitions() {{\n\tsfdisk --dump \"$1\" | sed -n 's/^.*[^0-9]\\([0-9][0-9]*\\) : start= *\\([0-9][0-9]*\\), size= *\\([0-9][0-9]*\\).*/\\1 \\2 \\3/p' > {map}\n}}\n"
        ),
    )?;
    let native: Vec<Box<dyn PartitionProbe>> =
        vec![Box::new(NativeMapProbe::new(helper, map.clone()))];
    assert_eq!(locate_rootfs_partition(&native, &image)?, expected);
    assert!(!map.exists());
    Ok(())
}

#[test]
fn test_extract_embedded_squashfs() -> Result<()> {
    for tool in ["sfdisk", "mksquashfs", "unsquashfs"] {
        if which::which(tool).is_err() {
            eprintln!("Skipping; {tool} not available");
            return Ok(());
        }
    }
    let td = tempfile::tempdir()?;
    let dir = Utf8Path::from_path(td.path()).unwrap();
    let tree = dir.join("tree");
    std::fs::create_dir_all(tree.join("etc"))?;
    std::fs::write(tree.join("etc/banner"), "firmware v2\n")?;
    std::fs::create_dir_all(tree.join("usr/bin"))?;
    std::fs::write(tree.join("usr/bin/app"), "binary")?;
    let squashfs = dir.join("rootfs.sqfs");
    let status = std::process::Command::new("mksquashfs")
        .args([tree.as_str(), squashfs.as_str(), "-noappend", "-no-progress"])
        .stdout(std::process::Stdio::null())
        .status()?;
    assert!(status.success());
    let payload = std::fs::read(&squashfs)?;

    // The rootfs partition is sized up to whole sectors around the payload
    let sectors = (payload.len() as u64).div_ceil(512).max(8);
    let image = dir.join("fw.img");
    std::fs::File::create(&image)?.set_len((4096 + sectors) * 512)?;
    partition_image(&image, sectors)?;
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut f = std::fs::OpenOptions::new().write(true).open(&image)?;
        f.seek(SeekFrom::Start(4096 * 512))?;
        f.write_all(&payload)?;
    }

    let sfdisk: Vec<Box<dyn PartitionProbe>> = vec![Box::new(SfdiskProbe)];
    let rootfs = locate_rootfs_partition(&sfdisk, &image)?;
    assert_eq!(rootfs.offset, 4096 * 512);
    let scratch = dir.join("scratch");
    let log = DebugLog::new(dir.join("debug.log"));
    let used = extract_rootfs(&default_extractors(), &image, &rootfs, &scratch, &log)?;
    assert_eq!(used, "unsquashfs");
    assert_eq!(
        std::fs::read_to_string(scratch.join("etc/banner"))?,
        "firmware v2\n"
    );
    assert_eq!(std::fs::read_to_string(scratch.join("usr/bin/app"))?, "binary");
    Ok(())
}
