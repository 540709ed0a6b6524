//! Runs a set of applications side by side.
//!
//! The orchestrator pairs every application with a `LifecycleManager` and a
//! `DirWatcher`, routes debounced change signals to restarts, and tears all of
//! it down in bounded time when interrupted.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{LaunchError, RunError};
use crate::process::AppSpec;
use crate::runner::{LifecycleManager, DEFAULT_STOP_GRACE};
use crate::session::SessionWorkspace;
use crate::watch::{DirWatcher, WatchSignals, DEFAULT_DEBOUNCE};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing knobs shared by every application of a run.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub debounce: Duration,
    pub stop_grace: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            stop_grace: DEFAULT_STOP_GRACE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Shared "the run is over" flag handed to every routing task.
#[derive(Debug, Clone)]
pub struct RunContext {
    done_tx: Arc<watch::Sender<bool>>,
}

impl Default for RunContext {
    fn default() -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            done_tx: Arc::new(done_tx),
        }
    }
}

impl RunContext {
    /// Marks the run as finished. Repeated calls are harmless.
    pub fn finish(&self) {
        self.done_tx.send_replace(true);
    }

    pub fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// Resolves once `finish` has been called.
    pub async fn done(&self) {
        let mut done_rx = self.done_tx.subscribe();
        let _ = done_rx.wait_for(|done| *done).await;
    }
}

pub struct Orchestrator {
    apps: BTreeMap<String, AppSpec>,
    settings: OrchestratorSettings,
    context: RunContext,
    managers: RwLock<HashMap<String, Arc<LifecycleManager>>>,
    watchers: RwLock<HashMap<String, DirWatcher>>,
    routers: Mutex<Vec<JoinHandle<()>>>,
    workspace: Mutex<Option<SessionWorkspace>>,
    // Set once a shutdown has run to completion.
    shut_down: AsyncMutex<bool>,
}

impl Orchestrator {
    pub fn new(apps: impl IntoIterator<Item = AppSpec>, settings: OrchestratorSettings) -> Self {
        Self {
            apps: apps
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
            settings,
            context: RunContext::default(),
            managers: RwLock::new(HashMap::new()),
            watchers: RwLock::new(HashMap::new()),
            routers: Mutex::new(Vec::new()),
            workspace: Mutex::new(None),
            shut_down: AsyncMutex::new(false),
        }
    }

    /// Starts the selected applications, then blocks until SIGINT, SIGTERM or
    /// `request_shutdown`, and shuts everything down.
    ///
    /// The signal handlers are installed before the first build, so an
    /// interrupt during startup also tears down whatever already started.
    pub async fn run(&self, names: &[String]) -> Result<(), RunError> {
        let mut interrupts = Interrupts::install();
        self.run_until(names, async move {
            interrupts.recv().await;
            log::info!("Received interrupt signal");
        })
        .await
    }

    /// Like `run`, with `interrupted` standing in for the process signals.
    pub async fn run_until<F>(&self, names: &[String], interrupted: F) -> Result<(), RunError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupted);
        tokio::select! {
            started = self.start(names) => started?,
            _ = &mut interrupted => {
                log::info!("Interrupted during startup");
                self.shutdown().await;
                return Ok(());
            }
        }
        tokio::select! {
            _ = &mut interrupted => {}
            _ = self.context.done() => {}
        }
        self.shutdown().await;
        Ok(())
    }

    /// Brings up every selected application concurrently.
    ///
    /// An empty `names` selects all configured applications. If any of them
    /// fails to come up, everything already started is shut down again.
    pub async fn start(&self, names: &[String]) -> Result<(), RunError> {
        let selected = self.select(names)?;

        let workspace = SessionWorkspace::create().map_err(RunError::Workspace)?;
        let specs: Vec<AppSpec> = selected
            .into_iter()
            .map(|mut spec| {
                workspace.translate(&mut spec);
                spec
            })
            .collect();
        *lock(&self.workspace) = Some(workspace);

        log::info!("Starting {} application(s)...", specs.len());
        let mut launches = JoinSet::new();
        for spec in specs {
            let name = spec.name.clone();
            let manager =
                Arc::new(LifecycleManager::new(spec).with_grace(self.settings.stop_grace));
            write(&self.managers).insert(name.clone(), Arc::clone(&manager));

            let debounce = self.settings.debounce;
            launches.spawn(async move {
                let result = launch(&manager, debounce).await;
                (name, manager, result)
            });
        }

        let mut failed = Vec::new();
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok((name, manager, Ok((watcher, signals)))) => {
                    write(&self.watchers).insert(name.clone(), watcher);
                    let router = tokio::spawn(route(name, manager, signals, self.context.clone()));
                    lock(&self.routers).push(router);
                }
                Ok((name, _, Err(err))) => {
                    log::error!("[{}] Failed to start: {}", name, err);
                    failed.push(name);
                }
                Err(err) => {
                    log::error!("Startup task failed: {}", err);
                    failed.push("<unknown>".to_string());
                }
            }
        }

        if !failed.is_empty() {
            failed.sort();
            self.shutdown().await;
            return Err(RunError::StartupFailed(failed));
        }
        log::info!("All applications started. Watching for changes...");
        Ok(())
    }

    /// Stops all watchers and applications and removes the session directory.
    ///
    /// Only the first completed call does anything; a call that is cancelled
    /// half way leaves the rest to the next one. Applications still alive when
    /// the shutdown timeout expires are killed outright.
    pub async fn shutdown(&self) {
        let mut shut_down = self.shut_down.lock().await;
        if *shut_down {
            return;
        }
        log::info!("Shutting down...");
        self.context.finish();

        let watchers: Vec<(String, DirWatcher)> = write(&self.watchers).drain().collect();
        for (name, mut watcher) in watchers {
            watcher.stop().await;
            log::debug!("[{}] watcher stopped", name);
        }

        let routers = std::mem::take(&mut *lock(&self.routers));
        for router in routers {
            let _ = router.await;
        }

        let managers: Vec<Arc<LifecycleManager>> = read(&self.managers).values().cloned().collect();
        let mut stops = JoinSet::new();
        for manager in &managers {
            log::debug!(
                "[{}] stopping: {} after {} restart(s), pid {:?}",
                manager.name(),
                manager.phase().label(),
                manager.restarts(),
                manager.pid()
            );
            let manager = Arc::clone(manager);
            stops.spawn(async move { manager.shutdown().await });
        }
        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            while stops.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!(
                "Timed out after {:?} waiting for applications to stop",
                self.settings.shutdown_timeout
            );
            for manager in &managers {
                manager.kill_now();
            }
            // Let the pending stops finish reaping in the background.
            stops.detach_all();
        }

        for manager in &managers {
            manager.clean_up();
        }

        let workspace = lock(&self.workspace).take();
        if let Some(mut workspace) = workspace {
            let path = workspace.path().to_path_buf();
            match workspace.close() {
                Ok(()) => log::debug!("removed session directory {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!(
                    "Failed to remove session directory {}: {}",
                    path.display(),
                    err
                ),
            }
        }
        *shut_down = true;
        log::info!("Shutdown complete");
    }

    /// Names of the applications that currently have a live process.
    pub fn running_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = read(&self.managers)
            .iter()
            .filter(|(_, manager)| manager.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Asks `run` to shut down, from any task.
    pub fn request_shutdown(&self) {
        if !self.context.is_done() {
            log::info!("Shutdown requested");
        }
        self.context.finish();
    }

    pub fn manager(&self, name: &str) -> Option<Arc<LifecycleManager>> {
        read(&self.managers).get(name).cloned()
    }

    fn select(&self, names: &[String]) -> Result<Vec<AppSpec>, RunError> {
        let selected = if names.is_empty() {
            self.apps.values().cloned().collect::<Vec<_>>()
        } else {
            let mut selected: Vec<AppSpec> = Vec::with_capacity(names.len());
            for name in names {
                let spec = self
                    .apps
                    .get(name)
                    .ok_or_else(|| RunError::AppNotFound(name.clone()))?;
                if !selected.iter().any(|s| s.name == spec.name) {
                    selected.push(spec.clone());
                }
            }
            selected
        };
        if selected.is_empty() {
            return Err(RunError::NoApplications);
        }
        Ok(selected)
    }
}

async fn launch(
    manager: &LifecycleManager,
    debounce: Duration,
) -> Result<(DirWatcher, WatchSignals), LaunchError> {
    manager.restart().await?;

    let spec = manager.spec();
    let mut watcher = DirWatcher::new(debounce)?;
    watcher.set_excludes(
        &spec.excludes.dirs,
        &spec.excludes.files,
        &spec.excludes.regexes,
    )?;
    watcher.set_follow_symlinks(spec.follow_symlinks);
    watcher.watch(&spec.watch_dir)?;
    let signals = watcher.start()?;
    log::info!("[{}] Watching {}", manager.name(), spec.watch_dir.display());
    Ok((watcher, signals))
}

// Turns change signals into restarts until the run is over.
async fn route(
    name: String,
    manager: Arc<LifecycleManager>,
    mut signals: WatchSignals,
    context: RunContext,
) {
    loop {
        tokio::select! {
            _ = context.done() => break,
            change = signals.events.recv() => {
                if change.is_none() {
                    break;
                }
                log::info!("[{}] Change detected, restarting...", name);
                tokio::select! {
                    _ = context.done() => break,
                    result = manager.restart() => {
                        if let Err(err) = result {
                            log::error!("[{}] Restart failed: {}", name, err);
                        }
                    }
                }
            }
            error = signals.errors.recv() => match error {
                Some(err) => log::warn!("[{}] Watcher error: {}", name, err),
                None => break,
            },
        }
    }
    log::debug!("[{}] router stopped", name);
}

// SIGINT and SIGTERM streams, registered as soon as this is built.
struct Interrupts {
    #[cfg(unix)]
    interrupt: Option<tokio::signal::unix::Signal>,
    #[cfg(unix)]
    terminate: Option<tokio::signal::unix::Signal>,
}

impl Interrupts {
    #[cfg(unix)]
    fn install() -> Self {
        use tokio::signal::unix::{signal, SignalKind};
        let listen = |kind: SignalKind, label: &str| match signal(kind) {
            Ok(stream) => Some(stream),
            Err(err) => {
                log::warn!("Failed to listen for {}: {}", label, err);
                None
            }
        };
        Self {
            interrupt: listen(SignalKind::interrupt(), "SIGINT"),
            terminate: listen(SignalKind::terminate(), "SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    fn install() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        async fn next(stream: &mut Option<tokio::signal::unix::Signal>) {
            match stream {
                Some(stream) => {
                    stream.recv().await;
                }
                None => std::future::pending().await,
            }
        }
        tokio::select! {
            _ = next(&mut self.interrupt) => {}
            _ = next(&mut self.terminate) => {}
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
