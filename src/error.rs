//! Error kinds for the stage 2 build.
//!
//! Every step of the build reports failures as a [`BuildError`]. The first
//! three kinds are ordinary build failures: the orchestrator logs them and
//! reports an unsuccessful build. [`BuildError::Internal`] marks a broken
//! invariant in the caller or the tool itself and is passed through.

use std::fmt;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    /// A query or post-install check returned something unexpected.
    #[error("{0}")]
    Verification(String),

    /// An external program failed to start or exited non-zero.
    #[error("{context} ({program} {status})")]
    Tool {
        program: String,
        status: ToolStatus,
        context: String,
    },

    /// A file or directory was missing, unreadable or unwritable.
    #[error("{context}: {source:#}")]
    Filesystem {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// How an external program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolStatus {
    Exited(i32),
    Signaled,
    NotStarted(String),
}

impl From<ExitStatus> for ToolStatus {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ToolStatus::Exited(code),
            None => ToolStatus::Signaled,
        }
    }
}

impl fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolStatus::Exited(code) => write!(f, "exited with status {}", code),
            ToolStatus::Signaled => write!(f, "was terminated by a signal"),
            ToolStatus::NotStarted(reason) => write!(f, "could not be started: {}", reason),
        }
    }
}

impl BuildError {
    pub fn verification(msg: impl Into<String>) -> Self {
        BuildError::Verification(msg.into())
    }

    pub fn tool(program: impl Into<String>, status: ToolStatus, context: impl Into<String>) -> Self {
        BuildError::Tool {
            program: program.into(),
            status,
            context: context.into(),
        }
    }

    pub fn filesystem(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        BuildError::Filesystem {
            context: context.into(),
            source: source.into(),
        }
    }

    /// True for the kinds the orchestrator turns into a failed build.
    pub fn is_build_failure(&self) -> bool {
        !matches!(self, BuildError::Internal(_))
    }
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Attach filesystem context to an `anyhow` result coming from the runtime.
pub(crate) trait FsContext<T> {
    fn fs_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> FsContext<T> for anyhow::Result<T> {
    fn fs_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| BuildError::filesystem(f(), e))
    }
}
