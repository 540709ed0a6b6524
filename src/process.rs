//! Data structures describing a supervised application.
//!
//! This module defines the immutable per-run specification of an application
//! (`AppSpec`), how its process is launched (`RunTarget`, `CommandLine`), and the
//! phases its lifecycle moves through (`LifecyclePhase`).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::signals::Signal;

/// A free-form command line.
///
/// Splitting is whitespace-only: quotes are not interpreted, so
/// `sh -c "echo hi"` becomes `["sh", "-c", "\"echo", "hi\""]`. Use
/// `RunTarget::Binary` when an argument needs embedded spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    text: String,
}

impl CommandLine {
    /// Returns `None` for blank input.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self {
                text: trimmed.to_string(),
            })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn argv(&self) -> Vec<&str> {
        self.text.split_whitespace().collect()
    }

    /// Replaces every occurrence of `from` with `to`.
    pub fn substitute(&mut self, from: &str, to: &str) {
        if self.text.contains(from) {
            self.text = self.text.replace(from, to);
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

/// How the application process is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    /// An executable path plus an explicit argument list.
    Binary { path: String, args: Vec<String> },
    /// A whitespace-split command line.
    CommandLine(CommandLine),
}

impl RunTarget {
    /// Resolves the program and its arguments.
    pub fn argv(&self) -> Vec<String> {
        match self {
            RunTarget::Binary { path, args } => {
                let mut argv = Vec::with_capacity(1 + args.len());
                argv.push(path.clone());
                argv.extend(args.iter().cloned());
                argv
            }
            RunTarget::CommandLine(line) => line.argv().into_iter().map(String::from).collect(),
        }
    }

    /// Human-readable form, quoted so it can be pasted into a shell.
    pub fn display(&self) -> String {
        shell_words::join(self.argv())
    }
}

/// Directory and file rules the watcher should skip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeRules {
    /// Directory base names, added to the built-in ignore set.
    pub dirs: Vec<String>,
    /// Globs matched against file base names.
    pub files: Vec<String>,
    /// Regexes matched against full paths.
    pub regexes: Vec<String>,
}

/// Delays applied around a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    /// Sleep before starting the new process.
    pub start_delay: Duration,
    /// Sleep after stopping the old process.
    pub kill_delay: Option<Duration>,
    /// Sleep before starting anyway after a failed build.
    pub rerun_delay: Duration,
}

/// Specification for an application to supervise.
#[derive(Debug, Clone)]
pub struct AppSpec {
    /// Unique name, used as the log prefix.
    pub name: String,
    /// What to run once the build is done. `None` means build-only.
    pub run: Option<RunTarget>,
    /// Build command. `None` skips the build step.
    pub build: Option<CommandLine>,
    /// Absolute path of the directory to watch.
    pub watch_dir: PathBuf,
    /// Working directory for hooks, build and run; inherits ours when unset.
    pub cwd: Option<PathBuf>,
    /// Environment overlay, applied over the inherited environment.
    pub env: HashMap<String, String>,
    pub timings: Timings,
    /// Start even when the build failed.
    pub rerun: bool,
    pub pre_cmds: Vec<CommandLine>,
    pub post_cmds: Vec<CommandLine>,
    pub excludes: ExcludeRules,
    pub follow_symlinks: bool,
    /// Signal used for graceful termination.
    pub stop_signal: Signal,
    /// Abort the restart sequence on hook, build or start errors.
    pub stop_on_error: bool,
    /// Suppress app output and informational lifecycle lines.
    pub log_silent: bool,
    /// Remove build artifacts and `tmp_dir` on shutdown.
    pub clean_on_exit: bool,
    /// Scratch directory for artifacts.
    pub tmp_dir: Option<PathBuf>,
    /// Prefix color name for console output.
    pub color: Option<String>,
}

impl AppSpec {
    /// A spec with the given name and watch directory and everything else off.
    pub fn new(name: impl Into<String>, watch_dir: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            run: None,
            build: None,
            watch_dir: watch_dir.into(),
            cwd: None,
            env: HashMap::new(),
            timings: Timings::default(),
            rerun: false,
            pre_cmds: Vec::new(),
            post_cmds: Vec::new(),
            excludes: ExcludeRules::default(),
            follow_symlinks: false,
            stop_signal: Signal::Terminate,
            stop_on_error: false,
            log_silent: false,
            clean_on_exit: false,
            tmp_dir: None,
            color: None,
        }
    }

    /// The binary artifact produced by the build, if the run target names one.
    pub fn artifact(&self) -> Option<PathBuf> {
        match &self.run {
            Some(RunTarget::Binary { path, .. }) => Some(PathBuf::from(path)),
            _ => None,
        }
    }
}

/// The phase an application's lifecycle is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// No process and no restart in progress.
    Idle,
    Stopping,
    PreHooks,
    Building,
    PostHooks,
    Delaying,
    Starting,
    /// A process is alive.
    Running,
    /// The manager has been shut down for good.
    Stopped,
}

impl LifecyclePhase {
    pub fn label(self) -> &'static str {
        match self {
            LifecyclePhase::Idle => "idle",
            LifecyclePhase::Stopping => "stopping",
            LifecyclePhase::PreHooks => "pre-hooks",
            LifecyclePhase::Building => "building",
            LifecyclePhase::PostHooks => "post-hooks",
            LifecyclePhase::Delaying => "delaying",
            LifecyclePhase::Starting => "starting",
            LifecyclePhase::Running => "running",
            LifecyclePhase::Stopped => "stopped",
        }
    }
}
