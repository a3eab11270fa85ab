//! The boot-time upgrade applier.
//!
//! This wraps the real init as the container's process 1. On every boot it
//! looks for the pending-upgrade marker; if there is one it is consumed,
//! the queued image is unpacked over the live rootfs, and only then is
//! control handed to the real init. Any failure after the marker has been
//! consumed abandons the upgrade and the device boots in its previous state.

use std::ffi::OsString;
use std::fmt::Display;
use std::os::unix::process::CommandExt;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use serde::Serialize;

use crate::apply::{apply_rootfs, ApplyMethod};
use crate::debuglog::DebugLog;
use crate::error::UpgradeError;
use crate::extract::{default_extractors, extract_rootfs, remove_dir_optional, RootfsExtractor};
use crate::layout::{
    open_parent, relative, Layout, CONFIG_BACKUP_PERSISTED, CONFIG_RESTORE_TARGETS,
    ENTRYPOINT_LOG, MARKER, SCRATCH_DIR,
};
use crate::marker::{consume_marker, Consumed};
use crate::partition::{default_probes, locate_rootfs_partition, PartitionProbe};
use crate::snapshot::create_snapshot;
use crate::store::{read_optional, timestamp_now};

/// The steps of applying a pending upgrade, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStep {
    /// Look for the marker.
    Check,
    /// Read and delete the marker.
    ConsumeMarker,
    /// Confirm the referenced image exists.
    ValidateImage,
    /// Find the rootfs partition of the image.
    LocatePartition,
    /// Unpack the rootfs into the scratch directory.
    Extract,
    /// Snapshot the current rootfs.
    Snapshot,
    /// Stage the configuration backup for the native restore logic.
    RestoreConfig,
    /// Replace the live rootfs.
    Apply,
    /// Remove scratch state and upgrade-only tooling.
    Cleanup,
    /// Hand over to the real init.
    Delegate,
}

impl Display for BootStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BootStep::Check => "check",
            BootStep::ConsumeMarker => "consume-marker",
            BootStep::ValidateImage => "validate-image",
            BootStep::LocatePartition => "locate-partition",
            BootStep::Extract => "extract",
            BootStep::Snapshot => "snapshot",
            BootStep::RestoreConfig => "restore-config",
            BootStep::Apply => "apply",
            BootStep::Cleanup => "cleanup",
            BootStep::Delegate => "delegate",
        };
        f.write_str(s)
    }
}

/// Details of an applied upgrade.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedUpgrade {
    /// The persisted image that was applied
    pub image: Utf8PathBuf,
    /// The extraction strategy that worked
    pub extractor: &'static str,
    /// How the tree was applied
    pub method: ApplyMethod,
    /// The snapshot of the previous rootfs, if one could be taken
    pub snapshot: Option<Utf8PathBuf>,
    /// Whether a configuration backup was staged for restoration
    pub config_restored: bool,
}

/// What happened on this boot.
#[derive(Debug)]
pub enum BootOutcome {
    /// No upgrade was queued.
    NoPendingUpgrade,
    /// An upgrade was queued but abandoned.
    Skipped(UpgradeError),
    /// The queued upgrade was applied.
    Applied(AppliedUpgrade),
}

/// Copy the persisted configuration backup to where the native restore
/// logic looks for it. Returns false if there is none.
pub fn restore_config(root: &Dir) -> Result<bool> {
    let Some(buf) = read_optional(root, Utf8Path::new(CONFIG_BACKUP_PERSISTED))? else {
        return Ok(false);
    };
    for target in CONFIG_RESTORE_TARGETS {
        let (dir, name) = open_parent(root, Utf8Path::new(target))?;
        dir.atomic_write(name, &buf)
            .with_context(|| format!("Writing /{target}"))?;
    }
    Ok(true)
}

/// Applies a pending upgrade at boot.
#[derive(Debug)]
pub struct BootApplier {
    layout: Layout,
    probes: Vec<Box<dyn PartitionProbe>>,
    extractors: Vec<Box<dyn RootfsExtractor>>,
    log: DebugLog,
}

impl BootApplier {
    /// An applier for the given layout using the default strategies.
    pub fn new(layout: Layout) -> Self {
        let probes = default_probes(&layout);
        let log = DebugLog::new(layout.path(ENTRYPOINT_LOG));
        Self {
            layout,
            probes,
            extractors: default_extractors(),
            log,
        }
    }

    /// Replace the partition probes.
    pub fn with_probes(mut self, probes: Vec<Box<dyn PartitionProbe>>) -> Self {
        self.probes = probes;
        self
    }

    /// Replace the rootfs extractors.
    pub fn with_extractors(mut self, extractors: Vec<Box<dyn RootfsExtractor>>) -> Self {
        self.extractors = extractors;
        self
    }

    /// The persistent log of the applier.
    pub fn log(&self) -> &DebugLog {
        &self.log
    }

    fn step(&self, step: BootStep) {
        self.log.info(format!("[{step}]"));
    }

    /// Apply the pending upgrade, if any. Nothing is written, not even the
    /// log, when no upgrade is pending.
    pub fn run(&self) -> BootOutcome {
        let marker = self.layout.path(MARKER);
        // Fast path
        if !marker.try_exists().unwrap_or(true) {
            return BootOutcome::NoPendingUpgrade;
        }
        self.log.info("Pending upgrade marker found");
        match self.run_pending() {
            Ok(Some(applied)) => {
                self.log.info(format!(
                    "Upgrade from {} completed successfully",
                    applied.image
                ));
                BootOutcome::Applied(applied)
            }
            Ok(None) => BootOutcome::NoPendingUpgrade,
            Err(e) => {
                self.log.warn(format!(
                    "Skipping upgrade, booting previous rootfs: {}",
                    e.chain()
                ));
                BootOutcome::Skipped(e)
            }
        }
    }

    fn run_pending(&self) -> Result<Option<AppliedUpgrade>, UpgradeError> {
        let root = self
            .layout
            .open_root()
            .map_err(|e| UpgradeError::MarkerRead { source: e.into() })?;

        self.step(BootStep::ConsumeMarker);
        let image = match consume_marker(&root) {
            Ok(Consumed::Image(p)) => p,
            Ok(Consumed::Empty) => return Err(UpgradeError::EmptyMarker),
            Ok(Consumed::Absent) => return Ok(None),
            Err(e) => return Err(UpgradeError::MarkerRead { source: e.into() }),
        };
        self.log.info(format!("Consumed marker for {image}"));

        self.step(BootStep::ValidateImage);
        let image_path = self.layout.path(&image);
        if !image_path.is_file() {
            return Err(UpgradeError::StaleMarker { path: image });
        }

        self.step(BootStep::LocatePartition);
        let rootfs = locate_rootfs_partition(&self.probes, &image_path).map_err(|_| {
            UpgradeError::RootfsNotLocated {
                path: image.clone(),
            }
        })?;
        self.log.info(format!("Rootfs partition at {rootfs}"));

        self.step(BootStep::Extract);
        let scratch = self.layout.path(SCRATCH_DIR);
        let extractor =
            extract_rootfs(&self.extractors, &image_path, &rootfs, &scratch, &self.log)?;

        let r = self.apply_extracted(&root, &image, &scratch);
        self.step(BootStep::Cleanup);
        self.cleanup(&root, &scratch, r.is_ok());
        let (method, snapshot, config_restored) = r?;
        Ok(Some(AppliedUpgrade {
            image,
            extractor,
            method,
            snapshot,
            config_restored,
        }))
    }

    fn apply_extracted(
        &self,
        root: &Dir,
        image: &Utf8Path,
        scratch: &Utf8Path,
    ) -> Result<(ApplyMethod, Option<Utf8PathBuf>, bool), UpgradeError> {
        self.step(BootStep::Snapshot);
        let snapshot = match create_snapshot(&self.layout, image, &timestamp_now()) {
            Ok(info) => {
                self.log.info(format!("Saved rootfs snapshot {}", info.snapshot));
                Some(info.snapshot)
            }
            Err(e) => {
                self.log.warn(format!("Snapshot failed, continuing: {e:#}"));
                None
            }
        };

        self.step(BootStep::RestoreConfig);
        let config_restored = match restore_config(root) {
            Ok(true) => {
                self.log.info("Staged configuration backup for restore");
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.log
                    .warn(format!("Staging configuration backup failed: {e:#}"));
                false
            }
        };

        self.step(BootStep::Apply);
        let method = apply_rootfs(&self.layout, scratch, &self.log)?;
        self.log.info(format!("Applied new rootfs ({method})"));
        Ok((method, snapshot, config_restored))
    }

    /// Best-effort removal of the scratch tree, and of upgrade-only tooling
    /// once an upgrade has been applied.
    fn cleanup(&self, root: &Dir, scratch: &Utf8Path, applied: bool) {
        if let Err(e) = remove_dir_optional(scratch) {
            self.log.warn(format!("{e:#}"));
        }
        if !applied {
            return;
        }
        for p in self.layout.config().upgrade.cleanup() {
            match root.remove_all_optional(relative(Utf8Path::new(p))) {
                Ok(true) => self.log.info(format!("Removed {p}")),
                Ok(false) => {}
                Err(e) => self.log.warn(format!("Removing {p}: {e}")),
            }
        }
    }

    /// Replace this process with the real init. Only returns on failure.
    pub fn delegate(&self, args: &[OsString]) -> anyhow::Error {
        let init = self.layout.path(self.layout.config().upgrade.real_init());
        tracing::debug!("{}: exec {init}", BootStep::Delegate);
        let e = std::process::Command::new(&init).args(args).exec();
        anyhow::Error::new(e).context(format!("Executing {init}"))
    }
}

/// Run the applier over the layout, then become the real init with the
/// given arguments. Only returns on failure.
pub fn entrypoint(layout: Layout, args: &[OsString]) -> anyhow::Error {
    let applier = BootApplier::new(layout);
    match applier.run() {
        BootOutcome::NoPendingUpgrade => tracing::debug!("No pending upgrade"),
        BootOutcome::Skipped(e) => tracing::debug!("Upgrade skipped: {e}"),
        BootOutcome::Applied(a) => tracing::debug!("Applied: {a:?}"),
    }
    applier.delegate(args)
}
