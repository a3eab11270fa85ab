//! Installing the pipeline into a device root: the upgrade hooks shim, the
//! boot stages and the link through which the init wrapper is invoked.

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::{Dir, Permissions, PermissionsExt};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::cli::INIT_BIN_NAME;

/// Sourced by the native upgrade tooling; removed again after an upgrade.
pub const HOOKS_SCRIPT: &str = "lib/upgrade/container-hooks.sh";
const SBIN: &str = "usr/sbin";
const BIN_NAME: &str = "cpe-upgrade";
const INIT_D: &str = "etc/init.d";
const RC_D: &str = "etc/rc.d";

/// A boot stage; the native init runs the `S<order><name>` links in
/// `/etc/rc.d` in name order.
#[derive(Debug)]
struct Stage {
    name: &'static str,
    order: u8,
    script: &'static str,
}

const STAGES: &[Stage] = &[
    Stage {
        name: "cpe-network-identity",
        order: 21,
        script: include_str!("../../contrib/init.d/cpe-network-identity"),
    },
    Stage {
        name: "cpe-reconcile-env",
        order: 99,
        script: include_str!("../../contrib/init.d/cpe-reconcile-env"),
    },
];

impl Stage {
    fn link_name(&self) -> String {
        format!("S{:02}{}", self.order, self.name)
    }
}

fn replace_symlink(dir: &Dir, target: &str, link: &str) -> Result<()> {
    dir.remove_file_optional(link)?;
    dir.symlink(target, link)
        .with_context(|| format!("Linking {link} to {target}"))
}

/// Install the hooks shim, the boot stages and the init wrapper link under
/// `root`. The `cpe-upgrade` binary itself is expected in `/usr/sbin`.
/// Reinstalling replaces everything written before.
#[context("Installing into device root")]
pub fn install(root: &Dir) -> Result<()> {
    let exec = || Permissions::from_mode(0o755);

    let (hooks_dir, hooks_name) = HOOKS_SCRIPT
        .rsplit_once('/')
        .ok_or_else(|| anyhow::anyhow!("Invalid hooks path {HOOKS_SCRIPT}"))?;
    root.create_dir_all(hooks_dir)?;
    root.open_dir(hooks_dir)?
        .atomic_write_with_perms(
            hooks_name,
            include_str!("../../contrib/container-hooks.sh"),
            exec(),
        )
        .with_context(|| format!("Writing {HOOKS_SCRIPT}"))?;

    root.create_dir_all(INIT_D)?;
    root.create_dir_all(RC_D)?;
    let init_d = root.open_dir(INIT_D)?;
    let rc_d = root.open_dir(RC_D)?;
    for stage in STAGES {
        init_d
            .atomic_write_with_perms(stage.name, stage.script, exec())
            .with_context(|| format!("Writing {INIT_D}/{}", stage.name))?;
        replace_symlink(&rc_d, &format!("../init.d/{}", stage.name), &stage.link_name())?;
    }

    root.create_dir_all(SBIN)?;
    replace_symlink(&root.open_dir(SBIN)?, BIN_NAME, INIT_BIN_NAME)?;
    tracing::debug!("Installed {HOOKS_SCRIPT} and {} boot stages", STAGES.len());
    Ok(())
}
