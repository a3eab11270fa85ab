//! Failure classification for the upgrade pipeline.

use camino::Utf8PathBuf;

type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// How a failure affects the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The upgrade request is rejected; no marker exists and the live
    /// system is untouched.
    AbortUpgrade,
    /// A queued upgrade is dropped; the marker is already consumed and the
    /// device boots into its previous state.
    SkipBoot,
}

/// Errors of the upgrade pipeline.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum UpgradeError {
    #[error("Firmware image {path} not found")]
    ImageNotFound { path: Utf8PathBuf },
    #[error("Firmware image {path} is not readable")]
    ImageUnreadable {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No rootfs partition found in {path}")]
    NoRootfsPartition { path: Utf8PathBuf },
    #[error("Persisting firmware image")]
    Persist {
        #[source]
        source: BoxedError,
    },
    #[error("Writing pending upgrade marker")]
    MarkerWrite {
        #[source]
        source: BoxedError,
    },
    #[error("Reading pending upgrade marker")]
    MarkerRead {
        #[source]
        source: BoxedError,
    },
    #[error("Pending upgrade marker is empty")]
    EmptyMarker,
    #[error("Pending upgrade references missing image {path}")]
    StaleMarker { path: Utf8PathBuf },
    #[error("Could not locate rootfs partition in {path}")]
    RootfsNotLocated { path: Utf8PathBuf },
    #[error("All rootfs extraction strategies failed for {path}")]
    Extraction { path: Utf8PathBuf },
    #[error("Applying new rootfs")]
    Apply {
        #[source]
        source: BoxedError,
    },
}

impl UpgradeError {
    /// Classify this failure.
    pub fn severity(&self) -> Severity {
        match self {
            UpgradeError::ImageNotFound { .. }
            | UpgradeError::ImageUnreadable { .. }
            | UpgradeError::NoRootfsPartition { .. }
            | UpgradeError::Persist { .. }
            | UpgradeError::MarkerWrite { .. } => Severity::AbortUpgrade,
            UpgradeError::MarkerRead { .. }
            | UpgradeError::EmptyMarker
            | UpgradeError::StaleMarker { .. }
            | UpgradeError::RootfsNotLocated { .. }
            | UpgradeError::Extraction { .. }
            | UpgradeError::Apply { .. } => Severity::SkipBoot,
        }
    }

    /// Format the error along with all of its causes on one line.
    pub fn chain(&self) -> String {
        let mut r = self.to_string();
        let mut cur: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(e) = cur {
            r.push_str(": ");
            r.push_str(&e.to_string());
            cur = e.source();
        }
        r
    }
}
