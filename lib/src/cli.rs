//! # Container firmware upgrade CLI
//!
//! Command line entry points of the upgrade pipeline: the hooks called by
//! the native upgrade tooling, the process-1 wrapper, and the late boot
//! helpers.

use std::ffi::OsString;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use clap::Parser;

use crate::config::Configuration;
use crate::hooks::{ContainerHooks, NativeUpgradeHooks};
use crate::layout::Layout;
use crate::netid::{IdentityOutcome, NetworkIdentity};
use crate::partition::{default_probes, locate_rootfs_partition};

/// When invoked under this name, behave as `entrypoint`.
pub const INIT_BIN_NAME: &str = "cpe-upgrade-init";

/// The platform hooks of the native upgrade tooling
#[derive(Debug, clap::Subcommand)]
pub(crate) enum HookOpts {
    /// Exit successfully if the image can be applied
    ImageIsValid {
        /// Path to the firmware image
        image: Utf8PathBuf,
    },
    /// Exit successfully if the switch to a RAM root must be skipped
    SkipRamfsSwitch,
    /// Queue the image to be applied on the next boot
    Commit {
        /// Path to the firmware image
        image: Utf8PathBuf,
    },
}

/// Options for the `network-identity` command
#[derive(Debug, Parser)]
pub(crate) struct NetworkIdentityOpts {
    /// The interface created by the container orchestrator
    #[clap(long)]
    pub(crate) interface: Option<String>,

    /// Seconds to wait for the interface to appear
    #[clap(long)]
    pub(crate) timeout: Option<u64>,
}

/// Firmware upgrades for CPE devices running as containers.
///
/// The native upgrade tooling is pointed at the `hook` commands, which
/// persist the image instead of flashing it. On the next container start,
/// `entrypoint` (running as process 1) applies the queued image and then
/// executes the real init.
#[derive(Debug, Parser)]
#[clap(name = "cpe-upgrade")]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Platform hooks for the native upgrade tooling.
    #[clap(subcommand)]
    Hook(HookOpts),
    /// Apply a pending upgrade, then execute the real init.
    ///
    /// All arguments are passed to the real init unchanged.
    Entrypoint {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<OsString>,
    },
    /// Remove duplicate variable assignments from environment files.
    ReconcileEnv {
        /// File to reconcile; defaults to the standard environment files
        #[clap(long)]
        file: Vec<Utf8PathBuf>,
    },
    /// Derive the device identity from its external network interface.
    NetworkIdentity(NetworkIdentityOpts),
    /// Display queued upgrades, persisted images and rootfs snapshots.
    Status {
        /// Output in JSON format.
        #[clap(long)]
        json: bool,
    },
    /// Install the upgrade hooks, the boot stages and the init wrapper link.
    Install {
        /// Root of the device filesystem
        #[clap(long, default_value = "/")]
        root: Utf8PathBuf,
    },
    /// Print the location of the rootfs partition in an image.
    #[clap(hide = true)]
    LocateRootfs {
        /// Path to the firmware image
        image: Utf8PathBuf,
    },
}

/// The arguments for the real init, if we were invoked as the init wrapper.
fn init_args(args: &[OsString]) -> Option<&[OsString]> {
    let (argv0, rest) = args.split_first()?;
    let name = Utf8Path::from_path(std::path::Path::new(argv0))?.file_name()?;
    (name == INIT_BIN_NAME).then_some(rest)
}

/// The entrypoint must never be blocked by a broken configuration.
fn boot_layout() -> Layout {
    Layout::system().unwrap_or_else(|e| {
        tracing::warn!("{e:#}; using defaults");
        Layout::new("/", Configuration::default())
    })
}

fn hook(opts: HookOpts) -> Result<()> {
    let hooks = ContainerHooks::new(Layout::system()?);
    match opts {
        HookOpts::ImageIsValid { image } => {
            anyhow::ensure!(hooks.image_is_valid(&image), "Image {image} is not valid");
        }
        HookOpts::SkipRamfsSwitch => {
            anyhow::ensure!(hooks.skip_ramfs_switch(), "Switch to RAM root required");
        }
        HookOpts::Commit { image } => {
            let r = hooks.commit_upgrade(&image)?;
            println!("{}", r.persisted);
        }
    }
    Ok(())
}

async fn network_identity(opts: NetworkIdentityOpts) -> Result<()> {
    let mut id = NetworkIdentity::new(Layout::system()?);
    if let Some(interface) = opts.interface {
        id = id.with_interface(interface);
    }
    if let Some(secs) = opts.timeout {
        id = id.with_timeout(Duration::from_secs(secs));
    }
    match id.run().await? {
        IdentityOutcome::AlreadyEstablished => {
            tracing::info!("Network identity already established")
        }
        IdentityOutcome::Published { mac, oui } => {
            tracing::info!("Published network identity {mac} ({oui})")
        }
    }
    Ok(())
}

fn locate_rootfs(image: &Utf8Path) -> Result<()> {
    let layout = Layout::system()?;
    let r = locate_rootfs_partition(&default_probes(&layout), image)?;
    let out = serde_json::to_string(&r).context("Serializing")?;
    println!("{out}");
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if let Some(init_args) = init_args(&args) {
        return Err(crate::boot::entrypoint(boot_layout(), init_args));
    }
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Hook(opts) => hook(opts),
        Opt::Entrypoint { args } => Err(crate::boot::entrypoint(boot_layout(), &args)),
        Opt::ReconcileEnv { file } => {
            let changed = crate::envfile::reconcile_all(&Layout::system()?, &file)?;
            tracing::debug!("Reconciled {} file(s)", changed.len());
            Ok(())
        }
        Opt::NetworkIdentity(opts) => network_identity(opts).await,
        Opt::Status { json } => crate::status::status(&Layout::system()?, json),
        Opt::Install { root } => {
            let root = Dir::open_ambient_dir(&root, cap_std::ambient_authority())
                .with_context(|| format!("Opening {root}"))?;
            crate::install::install(&root)
        }
        Opt::LocateRootfs { image } => locate_rootfs(&image),
    }
}

#[test]
fn test_parse_entrypoint_args() {
    let o = Opt::try_parse_from(["cpe-upgrade", "entrypoint", "--foo", "-b", "bar"]).unwrap();
    match o {
        Opt::Entrypoint { args } => assert_eq!(args, ["--foo", "-b", "bar"]),
        o => panic!("Expected entrypoint, not {o:?}"),
    }
}

#[test]
fn test_parse_hooks() {
    let o = Opt::try_parse_from(["cpe-upgrade", "hook", "commit", "/tmp/fw.img"]).unwrap();
    match o {
        Opt::Hook(HookOpts::Commit { image }) => assert_eq!(image, "/tmp/fw.img"),
        o => panic!("Expected commit hook, not {o:?}"),
    }
    let o = Opt::try_parse_from(["cpe-upgrade", "hook", "skip-ramfs-switch"]).unwrap();
    assert!(matches!(o, Opt::Hook(HookOpts::SkipRamfsSwitch)));
    assert!(Opt::try_parse_from(["cpe-upgrade", "hook", "image-is-valid"]).is_err());
}

#[test]
fn test_parse_reconcile_env() {
    let o = Opt::try_parse_from([
        "cpe-upgrade",
        "reconcile-env",
        "--file",
        "/etc/environment",
        "--file",
        "/var/etc/environment",
    ])
    .unwrap();
    match o {
        Opt::ReconcileEnv { file } => {
            assert_eq!(file, ["/etc/environment", "/var/etc/environment"])
        }
        o => panic!("Expected reconcile-env, not {o:?}"),
    }
}

#[test]
fn test_init_args() {
    let args: Vec<OsString> = ["/usr/sbin/cpe-upgrade-init", "--foo", "bar"]
        .into_iter()
        .map(Into::into)
        .collect();
    assert_eq!(init_args(&args).unwrap(), &args[1..]);
    let args: Vec<OsString> = ["cpe-upgrade", "status"]
        .into_iter()
        .map(Into::into)
        .collect();
    assert!(init_args(&args).is_none());
    assert!(init_args(&[]).is_none());
}

#[test]
fn test_parse_install() {
    let o = Opt::try_parse_from(["cpe-upgrade", "install"]).unwrap();
    assert!(matches!(o, Opt::Install { root } if root == "/"));
    let o = Opt::try_parse_from(["cpe-upgrade", "install", "--root", "/sysroot"]).unwrap();
    assert!(matches!(o, Opt::Install { root } if root == "/sysroot"));
}
