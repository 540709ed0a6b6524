//! Debounced directory watching.
//!
//! A `DirWatcher` registers every qualifying directory below a root with the OS
//! notification backend, filters out noise (metadata changes, editor swap files,
//! excluded paths), and coalesces bursts of events into one signal after a
//! quiet period. Directories created or moved in while watching are registered on
//! the fly, and forgotten again when they are removed or moved away.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use notify::event::ModifyKind;
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::WatchError;

/// Quiet period after the last relevant event before a change is signalled.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

const ERROR_BUFFER: usize = 10;

/// Directory names that are never watched.
const BUILTIN_IGNORED_DIRS: &[&str] = &[
    "tmp",
    ".tmp",
    "vendor",
    ".git",
    ".idea",
    ".vscode",
    "node_modules",
    "dist",
    "build",
    "target",
    ".next",
    ".nuxt",
];

/// Receiving ends of a started watcher.
#[derive(Debug)]
pub struct WatchSignals {
    /// One message per debounce window in which something relevant changed.
    pub events: mpsc::Receiver<()>,
    /// Errors reported by the notification backend.
    pub errors: mpsc::Receiver<notify::Error>,
}

/// Decides which directories and paths the watcher skips.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    dirs: HashSet<String>,
    files: Option<GlobSet>,
    regexes: Vec<Regex>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            dirs: BUILTIN_IGNORED_DIRS.iter().map(|dir| dir.to_string()).collect(),
            files: None,
            regexes: Vec::new(),
        }
    }
}

impl IgnoreRules {
    /// Adds directory names, file-name globs and full-path regexes.
    pub fn add_excludes(
        &mut self,
        dirs: &[String],
        files: &[String],
        regexes: &[String],
    ) -> Result<(), WatchError> {
        let mut compiled = Vec::with_capacity(regexes.len());
        for pattern in regexes {
            let regex = Regex::new(pattern).map_err(|error| WatchError::InvalidPattern {
                pattern: pattern.clone(),
                error,
            })?;
            compiled.push(regex);
        }

        let globset = if files.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in files {
                let glob = Glob::new(pattern).map_err(|error| WatchError::InvalidGlob {
                    pattern: pattern.clone(),
                    error,
                })?;
                builder.add(glob);
            }
            Some(builder.build().map_err(|error| WatchError::InvalidGlob {
                pattern: files.join(", "),
                error,
            })?)
        };

        self.dirs.extend(dirs.iter().map(|dir| dir.trim_end_matches('/').to_string()));
        self.regexes.extend(compiled);
        if globset.is_some() {
            self.files = globset;
        }
        Ok(())
    }

    /// Whether the directory at `path` (and its subtree) should not be watched.
    pub fn skips_dir(&self, path: &Path) -> bool {
        let Some(base) = path.file_name().and_then(OsStr::to_str) else {
            return false;
        };
        if is_hidden(base) || self.dirs.contains(base) {
            return true;
        }
        self.matches_regex(path)
    }

    /// Whether a change to `path` should be ignored.
    pub fn skips_path(&self, root: &Path, path: &Path) -> bool {
        let base = path.file_name().and_then(OsStr::to_str).unwrap_or("");
        if is_editor_noise(base) {
            return true;
        }
        if let Some(files) = &self.files {
            if files.is_match(base) {
                return true;
            }
        }
        if self.matches_regex(path) {
            return true;
        }
        self.in_ignored_dir(root, path)
    }

    fn matches_regex(&self, path: &Path) -> bool {
        let text = path.to_string_lossy();
        self.regexes.iter().any(|re| re.is_match(&text))
    }

    // Any ancestor between the root and the path that we would not have watched.
    fn in_ignored_dir(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        let mut components: Vec<_> = relative.components().collect();
        components.pop();
        components.into_iter().any(|component| match component {
            Component::Normal(name) => name
                .to_str()
                .map(|name| is_hidden(name) || self.dirs.contains(name))
                .unwrap_or(false),
            _ => false,
        })
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

/// Swap and backup files written by editors.
fn is_editor_noise(base: &str) -> bool {
    if base.ends_with('~') || base.starts_with(".#") {
        return true;
    }
    matches!(
        Path::new(base).extension().and_then(OsStr::to_str),
        Some("swp" | "swo" | "swx")
    )
}

fn is_relevant(event: &NotifyEvent, rules: &IgnoreRules, root: &Path) -> bool {
    match event.kind {
        EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)) => return false,
        _ => {}
    }
    if event.paths.is_empty() {
        return true;
    }
    event.paths.iter().any(|path| {
        if rules.skips_path(root, path) {
            return false;
        }
        !(path != root && path.is_dir() && rules.skips_dir(path))
    })
}

/// Registers directories with a notification backend.
pub trait DirRegistrar: Send + 'static {
    fn register(&mut self, dir: &Path) -> notify::Result<()>;

    /// Drops the registration of a directory that left the tree.
    fn unregister(&mut self, _dir: &Path) {}
}

impl DirRegistrar for RecommendedWatcher {
    fn register(&mut self, dir: &Path) -> notify::Result<()> {
        self.watch(dir, RecursiveMode::NonRecursive)
    }

    fn unregister(&mut self, dir: &Path) {
        // The kernel drops watches on deleted directories by itself.
        if let Err(err) = self.unwatch(dir) {
            log::debug!("unwatch {}: {}", dir.display(), err);
        }
    }
}

/// Walks `root` and registers every directory the rules allow.
///
/// The root itself is always registered; ignore rules apply below it. Returns the
/// number of newly registered directories.
fn register_tree<R: DirRegistrar>(
    registrar: &mut R,
    registered: &mut HashSet<PathBuf>,
    root: &Path,
    rules: &Arc<IgnoreRules>,
    follow_symlinks: bool,
) -> Result<usize, WatchError> {
    let filter_rules = Arc::clone(rules);
    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(follow_symlinks)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            entry.depth() == 0 || !is_dir || !filter_rules.skips_dir(entry.path())
        })
        .build();

    let mut added = 0;
    for entry in walker {
        let entry = entry.map_err(|error| WatchError::Walk {
            path: root.to_path_buf(),
            error,
        })?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let path = entry.into_path();
        if registered.contains(&path) {
            continue;
        }
        match registrar.register(&path) {
            Ok(()) => {
                registered.insert(path);
                added += 1;
            }
            Err(err) => log::warn!("Warning: failed to watch {}: {}", path.display(), err),
        }
    }
    Ok(added)
}

struct Debouncer<R> {
    registrar: R,
    registered: HashSet<PathBuf>,
    rules: Arc<IgnoreRules>,
    root: PathBuf,
    follow_symlinks: bool,
    window: Duration,
    events_tx: mpsc::Sender<()>,
    errors_tx: mpsc::Sender<notify::Error>,
}

impl<R: DirRegistrar> Debouncer<R> {
    fn new(
        registrar: R,
        rules: Arc<IgnoreRules>,
        root: PathBuf,
        follow_symlinks: bool,
        window: Duration,
    ) -> (Self, WatchSignals) {
        let (events_tx, events) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(ERROR_BUFFER);
        let debouncer = Self {
            registrar,
            registered: HashSet::new(),
            rules,
            root,
            follow_symlinks,
            window,
            events_tx,
            errors_tx,
        };
        (debouncer, WatchSignals { events, errors })
    }

    async fn run(
        mut self,
        mut raw_rx: mpsc::UnboundedReceiver<notify::Result<NotifyEvent>>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                raw = raw_rx.recv() => match raw {
                    Some(Ok(event)) => {
                        if self.accept(&event) {
                            deadline = Some(Instant::now() + self.window);
                        }
                    }
                    Some(Err(err)) => self.forward_error(err),
                    None => break,
                },
                _ = wait_for(deadline) => {
                    deadline = None;
                    // A full slot already holds an undelivered signal.
                    let _ = self.events_tx.try_send(());
                }
            }
        }
    }

    fn accept(&mut self, event: &NotifyEvent) -> bool {
        match event.kind {
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.forget(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths.iter().filter(|path| !path.exists()) {
                    self.forget(path);
                }
            }
            _ => {}
        }

        if !is_relevant(event, &self.rules, &self.root) {
            return false;
        }
        if matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        ) {
            for path in &event.paths {
                if path.is_dir() && !self.rules.skips_dir(path) {
                    if let Err(err) = register_tree(
                        &mut self.registrar,
                        &mut self.registered,
                        path,
                        &self.rules,
                        self.follow_symlinks,
                    ) {
                        self.forward_error(notify::Error::generic(&err.to_string()));
                    }
                }
            }
        }
        true
    }

    // Drop `path` and everything registered below it, so the same path is
    // registered again if it comes back.
    fn forget(&mut self, path: &Path) {
        let gone: Vec<PathBuf> = self
            .registered
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();
        for dir in gone {
            self.registered.remove(&dir);
            self.registrar.unregister(&dir);
        }
    }

    fn forward_error(&self, err: notify::Error) {
        match self.errors_tx.try_send(err) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(err)) => {
                log::warn!("Error channel full, dropping error: {}", err)
            }
        }
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Watches one directory tree and signals debounced changes.
pub struct DirWatcher {
    debounce: Duration,
    rules: IgnoreRules,
    follow_symlinks: bool,
    root: Option<PathBuf>,
    notifier: Option<RecommendedWatcher>,
    raw_rx: Option<mpsc::UnboundedReceiver<notify::Result<NotifyEvent>>>,
    registered: HashSet<PathBuf>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DirWatcher {
    pub fn new(debounce: Duration) -> Result<Self, WatchError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let notifier = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )?;
        Ok(Self {
            debounce,
            rules: IgnoreRules::default(),
            follow_symlinks: false,
            root: None,
            notifier: Some(notifier),
            raw_rx: Some(raw_rx),
            registered: HashSet::new(),
            stop_tx: None,
            task: None,
        })
    }

    pub fn set_excludes(
        &mut self,
        dirs: &[String],
        files: &[String],
        regexes: &[String],
    ) -> Result<(), WatchError> {
        self.rules.add_excludes(dirs, files, regexes)
    }

    pub fn set_follow_symlinks(&mut self, follow: bool) {
        self.follow_symlinks = follow;
    }

    /// Registers `root` and every qualifying directory below it.
    pub fn watch(&mut self, root: &Path) -> Result<usize, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::MissingRoot(root.to_path_buf()));
        }
        let notifier = self.notifier.as_mut().ok_or(WatchError::AlreadyStarted)?;
        let rules = Arc::new(self.rules.clone());
        let added = register_tree(
            notifier,
            &mut self.registered,
            root,
            &rules,
            self.follow_symlinks,
        )?;
        self.root = Some(root.to_path_buf());
        log::debug!("watching {} directories under {}", added, root.display());
        Ok(added)
    }

    /// Starts processing events in the background.
    pub fn start(&mut self) -> Result<WatchSignals, WatchError> {
        let (Some(notifier), Some(raw_rx)) = (self.notifier.take(), self.raw_rx.take()) else {
            return Err(WatchError::AlreadyStarted);
        };
        let (mut debouncer, signals) = Debouncer::new(
            notifier,
            Arc::new(self.rules.clone()),
            self.root.clone().unwrap_or_default(),
            self.follow_symlinks,
            self.debounce,
        );
        debouncer.registered = std::mem::take(&mut self.registered);

        let (stop_tx, stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);
        self.task = Some(tokio::spawn(debouncer.run(raw_rx, stop_rx)));
        Ok(signals)
    }

    /// Stops event processing and releases the notification handle.
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.notifier = None;
        self.raw_rx = None;
    }
}
