//! External command execution.
//!
//! All subprocesses (rpm, patch, tar, chmod, yum, mount) go through the
//! [`CommandRunner`] trait. A command never inherits a working directory
//! from the process: when a tool needs one it is set on the child only.

use log::{debug, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{BuildError, Result, ToolStatus};

/// A command line to run, with an optional working directory for the child.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    /// Let the child write straight to our stdout/stderr instead of capturing.
    pub stream_output: bool,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Append a path argument. Paths that are not valid UTF-8 are refused
    /// rather than passed on mangled.
    pub fn arg_path(self, path: &Path) -> Result<Self> {
        Ok(self.arg(path_str(path)?))
    }

    /// Run the child with `dir` as its working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn stream(mut self) -> Self {
        self.stream_output = true;
        self
    }
}

/// Borrow `path` as UTF-8 for use on a command line.
pub fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        BuildError::Internal(anyhow::anyhow!("path {:?} is not valid UTF-8", path))
    })
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: ToolStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Output of a command that exited with `code`. Mostly useful for fakes.
    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            status: ToolStatus::Exited(code),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == ToolStatus::Exited(0)
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion. Failing to spawn is a [`BuildError::Tool`];
    /// a non-zero exit is reported through [`CommandOutput::status`].
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Run `cmd` and turn a non-zero exit into a [`BuildError::Tool`] carrying `context`.
pub fn run_checked<C: CommandRunner + ?Sized>(
    runner: &C,
    cmd: &CommandSpec,
    context: impl FnOnce() -> String,
) -> Result<CommandOutput> {
    let output = runner.run(cmd)?;
    if !output.success() {
        let stderr = output.stderr.trim();
        if !stderr.is_empty() {
            warn!("{}: {}", cmd.program, stderr);
        }
        return Err(BuildError::tool(&cmd.program, output.status, context()));
    }
    Ok(output)
}

pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    #[tracing::instrument(skip(self), fields(cmd = %cmd))]
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running {}", cmd);
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(ref dir) = cmd.current_dir {
            command.current_dir(dir);
        }

        let started = if cmd.stream_output {
            command
                .stdin(Stdio::null())
                .status()
                .map(|status| CommandOutput {
                    status: status.into(),
                    stdout: String::new(),
                    stderr: String::new(),
                })
        } else {
            command.stdin(Stdio::null()).output().map(|output| CommandOutput {
                status: output.status.into(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        };

        started.map_err(|e| {
            BuildError::tool(
                &cmd.program,
                ToolStatus::NotStarted(e.to_string()),
                format!("unable to run {}. Is it installed?", cmd.program),
            )
        })
    }
}
