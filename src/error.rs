//! Error types shared by the lifecycle, watcher and orchestrator layers.
//!
//! The binary edge (`main`, `config`) works with `anyhow`; everything below it
//! returns these enums so callers can tell a failed build from a failed spawn.
//! Each message already carries the underlying error, so none of the variants
//! expose it again as a source.

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

/// Failure of a single hook/build command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("failed to spawn `{program}`: {error}")]
    Spawn {
        program: String,
        error: std::io::Error,
    },

    #[error("command failed: {status}\nOutput:\n{output}")]
    Failed { status: ExitStatus, output: String },
}

/// Failure of one step of an application's restart sequence.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("pre-command `{command}` failed: {error}")]
    PreHook {
        command: String,
        error: CommandError,
    },

    #[error("post-command `{command}` failed: {error}")]
    PostHook {
        command: String,
        error: CommandError,
    },

    #[error("build failed: {0}")]
    Build(CommandError),

    #[error("failed to start: {0}")]
    Start(CommandError),

    #[error("process already running")]
    AlreadyRunning,

    #[error("manager has been shut down")]
    Closed,
}

/// Failure while configuring or registering a directory watch.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("invalid regex pattern {pattern}: {error}")]
    InvalidPattern {
        pattern: String,
        error: regex::Error,
    },

    #[error("invalid file pattern {pattern}: {error}")]
    InvalidGlob {
        pattern: String,
        error: globset::Error,
    },

    #[error("watch directory {0} does not exist")]
    MissingRoot(PathBuf),

    #[error("failed to walk directory {path}: {error}")]
    Walk {
        path: PathBuf,
        error: ignore::Error,
    },

    #[error("failed to create watcher: {0}")]
    Notify(notify::Error),

    #[error("watcher already started")]
    AlreadyStarted,
}

impl From<notify::Error> for WatchError {
    fn from(err: notify::Error) -> Self {
        WatchError::Notify(err)
    }
}

/// Failure of the orchestrator's run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("app '{0}' not found in configuration")]
    AppNotFound(String),

    #[error("no applications configured")]
    NoApplications,

    #[error("failed to create session directory: {0}")]
    Workspace(std::io::Error),

    #[error("one or more applications failed to start: {}", .0.join(", "))]
    StartupFailed(Vec<String>),
}

/// Failure bringing a single application up.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Watch(#[from] WatchError),
}
