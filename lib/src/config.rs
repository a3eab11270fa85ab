//! # Configuration for the upgrade pipeline
//!
//! This module handles the optional TOML drop-in configuration stored in
//! `cpe-upgrade/` (e.g. `/etc/cpe-upgrade/10-lab.toml`). Every key has a
//! built-in default, so an absent configuration is valid.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

const DEFAULT_REAL_INIT: &str = "/sbin/init";
const DEFAULT_FALLBACK_IMAGES: &[&str] = &["/tmp/sysupgrade.img", "/tmp/firmware.img"];
const DEFAULT_SNAPSHOT_DIRS: &[&str] = &["bin", "etc", "lib", "root", "sbin", "usr", "www"];
const DEFAULT_PRESERVE: &[&str] = &["usr/sbin/cpe-upgrade", "usr/sbin/cpe-upgrade-init"];
const DEFAULT_CLEANUP: &[&str] = &["lib/upgrade/container-hooks.sh"];
const DEFAULT_NATIVE_HELPER: &str = "/lib/upgrade/common.sh";
const DEFAULT_INTERFACE: &str = "eth1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAC_VARIABLE: &str = "BASEMACADDRESS";
const DEFAULT_OUI_VARIABLE: &str = "MANUFACTUREROUI";

fn strs_or_default<'a>(v: &'a Option<Vec<String>>, default: &[&'static str]) -> Vec<&'a str> {
    match v {
        Some(v) => v.iter().map(String::as_str).collect(),
        None => default.to_vec(),
    }
}

fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
    if let Some(o) = o {
        *s = Some(o);
    }
}

/// The toplevel config entry for drop-ins stored in `cpe-upgrade/`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// The `[upgrade]` section.
    #[serde(default)]
    pub upgrade: UpgradeConfiguration,
    /// The `[network]` section.
    #[serde(default)]
    pub network: NetworkConfiguration,
}

impl Configuration {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        self.upgrade.merge(other.upgrade);
        self.network.merge(other.network);
    }
}

/// The serialized `[upgrade]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct UpgradeConfiguration {
    /// The init process the entrypoint hands over to
    pub real_init: Option<Utf8PathBuf>,
    /// Extra places an image handed to the commit hook may have been copied to
    pub fallback_images: Option<Vec<Utf8PathBuf>>,
    /// Top-level directories captured in rootfs snapshots
    pub snapshot_dirs: Option<Vec<String>>,
    /// Paths which applying a new rootfs must leave untouched
    pub preserve: Option<Vec<String>>,
    /// Upgrade-only tooling removed once an upgrade is applied
    pub cleanup: Option<Vec<String>>,
    /// Shell library providing the native `get_partitions` helper
    pub native_helper: Option<Utf8PathBuf>,
}

impl UpgradeConfiguration {
    fn merge(&mut self, other: Self) {
        mergeopt(&mut self.real_init, other.real_init);
        mergeopt(&mut self.fallback_images, other.fallback_images);
        mergeopt(&mut self.snapshot_dirs, other.snapshot_dirs);
        mergeopt(&mut self.preserve, other.preserve);
        mergeopt(&mut self.cleanup, other.cleanup);
        mergeopt(&mut self.native_helper, other.native_helper);
    }

    /// The init process to delegate to.
    pub fn real_init(&self) -> &Utf8Path {
        self.real_init
            .as_deref()
            .unwrap_or(Utf8Path::new(DEFAULT_REAL_INIT))
    }

    /// Fallback locations for the firmware image.
    pub fn fallback_images(&self) -> Vec<&Utf8Path> {
        match &self.fallback_images {
            Some(v) => v.iter().map(|p| p.as_path()).collect(),
            None => DEFAULT_FALLBACK_IMAGES
                .iter()
                .map(|p| Utf8Path::new(*p))
                .collect(),
        }
    }

    /// Directories included in rootfs snapshots.
    pub fn snapshot_dirs(&self) -> Vec<&str> {
        strs_or_default(&self.snapshot_dirs, DEFAULT_SNAPSHOT_DIRS)
    }

    /// Paths preserved when applying a new rootfs.
    pub fn preserve(&self) -> Vec<&str> {
        strs_or_default(&self.preserve, DEFAULT_PRESERVE)
    }

    /// Paths removed after an upgrade is applied.
    pub fn cleanup(&self) -> Vec<&str> {
        strs_or_default(&self.cleanup, DEFAULT_CLEANUP)
    }

    /// The native shell helper library.
    pub fn native_helper(&self) -> &Utf8Path {
        self.native_helper
            .as_deref()
            .unwrap_or(Utf8Path::new(DEFAULT_NATIVE_HELPER))
    }
}

/// The serialized `[network]` section.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct NetworkConfiguration {
    /// Interface created by the container orchestrator
    pub interface: Option<String>,
    /// How long to wait for the interface to appear
    pub timeout_secs: Option<u64>,
    /// Environment variable holding the MAC address
    pub mac_variable: Option<String>,
    /// Environment variable holding the organizational identifier
    pub oui_variable: Option<String>,
}

impl NetworkConfiguration {
    fn merge(&mut self, other: Self) {
        mergeopt(&mut self.interface, other.interface);
        mergeopt(&mut self.timeout_secs, other.timeout_secs);
        mergeopt(&mut self.mac_variable, other.mac_variable);
        mergeopt(&mut self.oui_variable, other.oui_variable);
    }

    /// The interface name.
    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or(DEFAULT_INTERFACE)
    }

    /// The polling timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    /// The MAC address variable name.
    pub fn mac_variable(&self) -> &str {
        self.mac_variable.as_deref().unwrap_or(DEFAULT_MAC_VARIABLE)
    }

    /// The organizational identifier variable name.
    pub fn oui_variable(&self) -> &str {
        self.oui_variable.as_deref().unwrap_or(DEFAULT_OUI_VARIABLE)
    }
}

/// Parse a single configuration fragment; unknown keys are reported
/// as warnings rather than errors.
pub(crate) fn parse_fragment(buf: &str, name: &str) -> Result<Configuration> {
    let mut unused = std::collections::BTreeSet::new();
    let de = toml::Deserializer::new(buf);
    let c: Configuration = serde_ignored::deserialize(de, |path| {
        unused.insert(path.to_string());
    })
    .with_context(|| format!("Parsing {name}"))?;
    for key in unused {
        tracing::warn!("{name}: Unknown key {key}");
    }
    Ok(c)
}

#[context("Loading configuration")]
/// Load the configuration, merging all found configuration files.
pub(crate) fn load_config() -> Result<Configuration> {
    const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/etc", "/run"];
    let fragments = liboverdrop::scan(SYSTEMD_CONVENTIONAL_BASES, "cpe-upgrade", &["toml"], true);
    let mut config = Configuration::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path)?;
        let c = parse_fragment(&buf, &path.to_string_lossy())?;
        tracing::debug!("Merging config {path:?}: {c:?}");
        config.merge(c);
    }
    Ok(config)
}

#[test]
fn test_defaults() {
    let c = Configuration::default();
    assert_eq!(c.upgrade.real_init(), "/sbin/init");
    assert_eq!(c.upgrade.native_helper(), "/lib/upgrade/common.sh");
    assert_eq!(
        c.upgrade.fallback_images(),
        [
            Utf8Path::new("/tmp/sysupgrade.img"),
            Utf8Path::new("/tmp/firmware.img")
        ]
    );
    assert!(c.upgrade.snapshot_dirs().contains(&"etc"));
    assert_eq!(c.network.interface(), "eth1");
    assert_eq!(c.network.timeout().as_secs(), 30);
    assert_eq!(c.network.mac_variable(), "BASEMACADDRESS");
    assert_eq!(c.network.oui_variable(), "MANUFACTUREROUI");
}

#[test]
/// Verify that we can parse and merge config fragments
fn test_parse_config() {
    let mut c = parse_fragment(
        r##"[upgrade]
real-init = "/sbin/procd"
cleanup = ["usr/bin/unsquashfs"]

[network]
interface = "eth0"
"##,
        "10-base.toml",
    )
    .unwrap();
    assert_eq!(c.upgrade.real_init(), "/sbin/procd");
    assert_eq!(c.upgrade.cleanup(), ["usr/bin/unsquashfs"]);
    assert_eq!(c.network.interface(), "eth0");

    let other = parse_fragment(
        r##"[network]
interface = "eth2"
timeout-secs = 5
some-unknown-key = true
"##,
        "20-override.toml",
    )
    .unwrap();
    c.merge(other);
    // Overridden
    assert_eq!(c.network.interface(), "eth2");
    assert_eq!(c.network.timeout().as_secs(), 5);
    // Retained from the earlier fragment
    assert_eq!(c.upgrade.real_init(), "/sbin/procd");
    assert_eq!(c.upgrade.cleanup(), ["usr/bin/unsquashfs"]);
}

#[test]
fn test_parse_invalid() {
    assert!(parse_fragment("[network]\ntimeout-secs = \"soon\"\n", "bad.toml").is_err());
}
