use std::{
    ffi::OsStr,
    process::{Command, Stdio},
};

use anyhow::Result;
use cpe_upgrade_utils::CommandRunExt;

/// An external command run as one described step of the pipeline.
pub(crate) struct Task {
    description: String,
    quiet: bool,
    pub(crate) cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<OsStr>) -> Self {
        let description = description.as_ref().to_string();
        let mut cmd = Command::new(exe);
        // Default to noninteractive; we may be running as pid 1 with no tty
        cmd.stdin(Stdio::null());
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    /// Run the command, returning an error including the tail of stderr
    /// if the command does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        let description = self.description;
        let mut cmd = self.cmd;
        if !self.quiet {
            tracing::info!("{description}");
        }
        cmd.log_debug()
            .run()
            .map_err(|e| e.context(format!("Task {description} failed")))
    }
}
