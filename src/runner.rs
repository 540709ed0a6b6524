//! Per-application process lifecycle.
//!
//! `LifecycleManager` drives one application through its restart sequence
//! (stop, pre-hooks, build, post-hooks, delay, start) and guarantees that at most
//! one process is alive for that application at any time. Hooks and builds run to
//! completion with their output captured; the application process itself is
//! spawned in its own process group with its output streamed line by line.

use std::ffi::OsStr;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};

use crate::error::{CommandError, LifecycleError};
use crate::output::{Console, StreamKind};
use crate::process::{AppSpec, CommandLine, LifecyclePhase};
use crate::signals::{signaller_for, Signal, Signaller};

/// How long a process gets to exit after the stop signal before it is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// Owns the lifecycle of one application's process.
pub struct LifecycleManager {
    spec: Arc<AppSpec>,
    console: Console,
    grace: Duration,
    state: Arc<Mutex<ManagedProcess>>,
}

struct ManagedProcess {
    child: Option<ChildHandle>,
    phase: LifecyclePhase,
    // Bumped on every successful spawn; the reaper only clears its own child.
    generation: u64,
    restarts: u64,
    tmp_files: Vec<PathBuf>,
    closed: bool,
}

struct ChildHandle {
    pid: u32,
    generation: u64,
    signaller: Arc<dyn Signaller>,
    exited: watch::Receiver<bool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl LifecycleManager {
    pub fn new(spec: AppSpec) -> Self {
        let console = Console::new(&spec.name, spec.color.as_deref());
        Self {
            spec: Arc::new(spec),
            console,
            grace: DEFAULT_STOP_GRACE,
            state: Arc::new(Mutex::new(ManagedProcess {
                child: None,
                phase: LifecyclePhase::Idle,
                generation: 0,
                restarts: 0,
                tmp_files: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Overrides the stop grace window.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &AppSpec {
        &self.spec
    }

    pub fn is_running(&self) -> bool {
        self.state().child.is_some()
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.state().phase
    }

    /// PID of the live process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.state().child.as_ref().map(|child| child.pid)
    }

    /// Number of restart sequences begun so far.
    pub fn restarts(&self) -> u64 {
        self.state().restarts
    }

    /// Runs the full restart sequence.
    ///
    /// Returns once the new process has been spawned, or with the error that
    /// aborted the sequence. Calls for the same application must not overlap;
    /// the manager does not queue them.
    pub async fn restart(&self) -> Result<(), LifecycleError> {
        let attempt = {
            let mut state = self.state();
            if state.closed {
                return Err(LifecycleError::Closed);
            }
            state.restarts += 1;
            state.restarts
        };
        self.info(format_args!("Restarting (#{})...", attempt));

        self.stop().await;

        if let Some(delay) = self.spec.timings.kill_delay.filter(|d| !d.is_zero()) {
            self.info(format_args!("Waiting {:?} after stop...", delay));
            tokio::time::sleep(delay).await;
        }

        self.set_phase(LifecyclePhase::PreHooks);
        for command in &self.spec.pre_cmds {
            self.info(format_args!("Running pre-command: {}", command));
            if let Err(err) = self.run_command(command).await {
                log::warn!("[{}] Pre-command failed: {}", self.spec.name, err);
                if self.spec.stop_on_error {
                    self.set_phase(LifecyclePhase::Idle);
                    return Err(LifecycleError::PreHook {
                        command: command.as_str().to_owned(),
                        error: err,
                    });
                }
            }
        }

        if let Some(build) = &self.spec.build {
            self.set_phase(LifecyclePhase::Building);
            self.info(format_args!("Building: {}", build));
            match self.run_command(build).await {
                Ok(()) => self.info("Build successful"),
                Err(err) => {
                    log::warn!("[{}] Build failed: {}", self.spec.name, err);
                    if !self.spec.rerun {
                        self.set_phase(LifecyclePhase::Idle);
                        return Err(LifecycleError::Build(err));
                    }
                    let delay = self.spec.timings.rerun_delay;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            if self.spec.clean_on_exit {
                if let Some(artifact) = self.spec.artifact() {
                    self.track_tmp_file(artifact);
                }
            }
        }

        self.set_phase(LifecyclePhase::PostHooks);
        for command in &self.spec.post_cmds {
            self.info(format_args!("Running post-command: {}", command));
            if let Err(err) = self.run_command(command).await {
                log::warn!("[{}] Post-command failed: {}", self.spec.name, err);
                if self.spec.stop_on_error {
                    self.set_phase(LifecyclePhase::Idle);
                    return Err(LifecycleError::PostHook {
                        command: command.as_str().to_owned(),
                        error: err,
                    });
                }
            }
        }

        let delay = self.spec.timings.start_delay;
        if !delay.is_zero() {
            self.set_phase(LifecyclePhase::Delaying);
            self.info(format_args!("Waiting {}ms before starting...", delay.as_millis()));
            tokio::time::sleep(delay).await;
        }

        if let Err(err) = self.start() {
            log::warn!("[{}] Failed to start: {}", self.spec.name, err);
            return Err(err);
        }
        Ok(())
    }

    /// Spawns the application process.
    ///
    /// The process gets its own process group, the merged environment, and two
    /// reader tasks for its output. A reaper task clears the running state when
    /// it exits; this call does not wait for that.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut state = self.state();
        if state.closed {
            return Err(LifecycleError::Closed);
        }
        if state.child.is_some() {
            return Err(LifecycleError::AlreadyRunning);
        }
        let Some(target) = &self.spec.run else {
            self.info("No run command specified, skipping");
            state.phase = LifecyclePhase::Idle;
            return Ok(());
        };

        let argv = target.argv();
        let Some((program, args)) = argv.split_first() else {
            state.phase = LifecyclePhase::Idle;
            return Err(LifecycleError::Start(CommandError::Empty));
        };
        state.phase = LifecyclePhase::Starting;
        log::debug!("[{}] spawning {}", self.spec.name, target.display());

        let mut command = self.command(program, args);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                state.phase = LifecyclePhase::Idle;
                return Err(LifecycleError::Start(CommandError::Spawn {
                    program: program.clone(),
                    error,
                }));
            }
        };
        let pid = child.id().unwrap_or(0);
        let signaller: Arc<dyn Signaller> = Arc::from(signaller_for(pid));

        let silent = self.spec.log_silent;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(self.console.clone(), StreamKind::Stdout, stdout, silent));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(self.console.clone(), StreamKind::Stderr, stderr, silent));
        }

        state.generation += 1;
        let generation = state.generation;
        let (exit_tx, exit_rx) = watch::channel(false);
        let (kill_tx, kill_rx) = oneshot::channel();
        state.child = Some(ChildHandle {
            pid,
            generation,
            signaller,
            exited: exit_rx,
            kill_tx: Some(kill_tx),
        });
        state.phase = LifecyclePhase::Running;
        drop(state);

        tokio::spawn(reap(
            child,
            kill_rx,
            exit_tx,
            Arc::clone(&self.state),
            generation,
            self.spec.name.clone(),
        ));

        log::info!("[{}] Started successfully (PID: {})", self.spec.name, pid);
        Ok(())
    }

    /// Stops the running process, if any.
    ///
    /// Sends the configured signal, waits up to the grace window, then kills the
    /// whole process group and waits for it to be reaped. Never fails.
    pub async fn stop(&self) {
        let (pid, generation, signaller, mut exited, kill_tx) = {
            let mut state = self.state();
            let Some(child) = state.child.as_mut() else {
                return;
            };
            let taken = (
                child.pid,
                child.generation,
                Arc::clone(&child.signaller),
                child.exited.clone(),
                child.kill_tx.take(),
            );
            state.phase = LifecyclePhase::Stopping;
            taken
        };

        self.info(format_args!("Stopping process (PID: {})...", pid));
        let signal = self.spec.stop_signal;
        if let Err(err) = signaller.signal(signal) {
            log::warn!(
                "[{}] Failed to send {} to {}: {}",
                self.spec.name,
                signal.label(),
                signaller.describe(),
                err
            );
        }

        let graceful = tokio::time::timeout(self.grace, exited.wait_for(|done| *done))
            .await
            .is_ok();
        if graceful {
            log::info!("[{}] Process stopped gracefully", self.spec.name);
        } else {
            log::warn!(
                "[{}] Process didn't stop gracefully, force killing...",
                self.spec.name
            );
            if signaller.is_alive() {
                if let Err(err) = signaller.signal(Signal::Kill) {
                    log::debug!("[{}] SIGKILL to {}: {}", self.spec.name, signaller.describe(), err);
                }
            }
            if let Some(kill_tx) = kill_tx {
                let _ = kill_tx.send(());
            }
            let _ = exited.wait_for(|done| *done).await;
        }

        let mut state = self.state();
        if state.child.as_ref().map(|child| child.generation) == Some(generation) {
            state.child = None;
        }
        if state.phase == LifecyclePhase::Stopping {
            state.phase = LifecyclePhase::Idle;
        }
    }

    /// Sends SIGKILL to the live process group without waiting for it.
    ///
    /// The reaper still clears the running state once the process is gone.
    pub fn kill_now(&self) {
        let signaller = match self.state().child.as_ref() {
            Some(child) => Arc::clone(&child.signaller),
            None => return,
        };
        if !signaller.is_alive() {
            return;
        }
        log::warn!("[{}] Killing {}", self.spec.name, signaller.describe());
        if let Err(err) = signaller.signal(Signal::Kill) {
            log::debug!("[{}] SIGKILL to {}: {}", self.spec.name, signaller.describe(), err);
        }
    }

    /// Stops the process and refuses any further starts.
    pub async fn shutdown(&self) {
        self.state().closed = true;
        self.stop().await;
        self.set_phase(LifecyclePhase::Stopped);
    }

    /// Removes tracked build artifacts and the temp directory when
    /// `clean_on_exit` is set. Safe to call repeatedly.
    pub fn clean_up(&self) {
        if !self.spec.clean_on_exit {
            return;
        }

        let files = self.state().tmp_files.clone();
        for file in files {
            match std::fs::remove_file(&file) {
                Ok(()) => self.info(format_args!("Removed temp file: {}", file.display())),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!(
                    "[{}] Failed to remove temp file {}: {}",
                    self.spec.name,
                    file.display(),
                    err
                ),
            }
        }

        if let Some(dir) = &self.spec.tmp_dir {
            if !is_removable_dir(dir) {
                log::warn!(
                    "[{}] Refusing to remove temp directory {}",
                    self.spec.name,
                    dir.display()
                );
                return;
            }
            match std::fs::remove_dir_all(dir) {
                Ok(()) => self.info(format_args!("Removed temp directory: {}", dir.display())),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => log::warn!(
                    "[{}] Failed to remove temp directory {}: {}",
                    self.spec.name,
                    dir.display(),
                    err
                ),
            }
        }
    }

    // Run a hook or build command to completion, capturing its output.
    async fn run_command(&self, line: &CommandLine) -> Result<(), CommandError> {
        let argv = line.argv();
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Empty);
        };
        let mut command = self.command(program, args);
        command.stdin(Stdio::null()).kill_on_drop(true);
        let output = command.output().await.map_err(|error| CommandError::Spawn {
            program: program.to_string(),
            error,
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(CommandError::Failed {
                status: output.status,
                output: combined,
            });
        }
        if !self.spec.log_silent {
            self.console.captured(&combined);
        }
        Ok(())
    }

    fn command<S: AsRef<OsStr>>(&self, program: &str, args: &[S]) -> Command {
        let mut command = Command::new(program);
        command.args(args);
        if let Some(cwd) = &self.spec.cwd {
            command.current_dir(cwd);
        }
        if !self.spec.env.is_empty() {
            command.envs(&self.spec.env);
        }
        command
    }

    fn track_tmp_file(&self, path: PathBuf) {
        let mut state = self.state();
        if !state.tmp_files.contains(&path) {
            state.tmp_files.push(path);
        }
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        let mut state = self.state();
        if state.phase != phase {
            log::debug!(
                "[{}] {} -> {}",
                self.spec.name,
                state.phase.label(),
                phase.label()
            );
            state.phase = phase;
        }
    }

    fn info(&self, message: impl Display) {
        if !self.spec.log_silent {
            log::info!("[{}] {}", self.spec.name, message);
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagedProcess> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Wait for the child to exit (or for a kill request), then clear the running
// state if it still belongs to this generation.
async fn reap(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<bool>,
    state: Arc<Mutex<ManagedProcess>>,
    generation: u64,
    name: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    match status {
        Ok(status) if status.success() => log::info!("[{}] Process exited normally", name),
        Ok(status) => log::info!("[{}] Process exited with error: {}", name, status),
        Err(err) => log::warn!("[{}] Failed to wait for process: {}", name, err),
    }

    {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.child.as_ref().map(|child| child.generation) == Some(generation) {
            state.child = None;
            if state.phase == LifecyclePhase::Running {
                state.phase = LifecyclePhase::Idle;
            }
        }
    }
    let _ = exit_tx.send(true);
}

// Forward output line by line until EOF. Bytes that are not valid UTF-8 are
// rendered lossily; the pipe stays drained so the process never sees EPIPE.
async fn read_stream<R>(console: Console, stream: StreamKind, reader: R, silent: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if silent {
                    continue;
                }
                while matches!(buf.last(), Some(b'\n' | b'\r')) {
                    buf.pop();
                }
                console.line(stream, &String::from_utf8_lossy(&buf));
            }
            Err(err) => {
                if !silent {
                    log::warn!("{} error reading {:?}: {}", console.prefix(), stream, err);
                }
                break;
            }
        }
    }
}

/// Whether `dir` may be deleted recursively during clean-up.
///
/// Refuses filesystem roots, `.`, the current directory and the system temp
/// directory itself.
pub fn is_removable_dir(dir: &Path) -> bool {
    if dir.as_os_str().is_empty() || dir == Path::new(".") || dir.parent().is_none() {
        return false;
    }
    let resolved = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    if resolved.parent().is_none() {
        return false;
    }
    let protected = [std::env::current_dir().ok(), Some(std::env::temp_dir())];
    !protected.into_iter().flatten().any(|path| {
        let path = path.canonicalize().unwrap_or(path);
        path == resolved
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::RunTarget;
    use std::time::Instant;

    fn scratch() -> tempfile::TempDir {
        tempfile::Builder::new().prefix("hotrack-runner").tempdir().unwrap()
    }

    fn line(text: &str) -> CommandLine {
        CommandLine::parse(text).unwrap()
    }

    fn shell(script: &str) -> RunTarget {
        RunTarget::Binary {
            path: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn spec(dir: &Path) -> AppSpec {
        let mut spec = AppSpec::new("test", dir);
        spec.run = Some(RunTarget::CommandLine(line("sleep 30")));
        spec
    }

    fn pid_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    #[tokio::test]
    async fn stop_without_process_is_noop() {
        let dir = scratch();
        let manager = LifecycleManager::new(spec(dir.path()));
        manager.stop().await;
        assert!(!manager.is_running());
        assert_eq!(manager.phase(), LifecyclePhase::Idle);
    }

    #[tokio::test]
    async fn restart_builds_then_runs() {
        let dir = scratch();
        let marker = dir.path().join("marker");
        let mut spec = spec(dir.path());
        spec.build = Some(line(&format!("touch {}", marker.display())));
        let manager = LifecycleManager::new(spec);

        manager.restart().await.unwrap();
        assert!(marker.exists());
        assert!(wait_until(|| manager.is_running(), Duration::from_secs(2)).await);
        assert_eq!(manager.phase(), LifecyclePhase::Running);

        manager.stop().await;
        assert!(!manager.is_running());
        assert_eq!(manager.phase(), LifecyclePhase::Idle);
    }

    #[tokio::test]
    async fn failing_build_without_rerun_never_starts() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.build = Some(line("false"));
        let manager = LifecycleManager::new(spec);

        let err = manager.restart().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Build(CommandError::Failed { .. })));
        assert!(!manager.is_running());
        assert_eq!(manager.phase(), LifecyclePhase::Idle);
    }

    #[tokio::test]
    async fn failing_build_with_rerun_still_starts() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.build = Some(line("false"));
        spec.rerun = true;
        let manager = LifecycleManager::new(spec);

        manager.restart().await.unwrap();
        assert!(manager.is_running());
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn failing_pre_hook_aborts_with_stop_on_error() {
        let dir = scratch();
        let marker = dir.path().join("built");
        let mut spec = spec(dir.path());
        spec.pre_cmds = vec![line("false")];
        spec.build = Some(line(&format!("touch {}", marker.display())));
        spec.stop_on_error = true;
        let manager = LifecycleManager::new(spec);

        let err = manager.restart().await.unwrap_err();
        assert!(matches!(err, LifecycleError::PreHook { ref command, .. } if command == "false"));
        assert!(!marker.exists());
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn failing_hooks_are_tolerated_without_stop_on_error() {
        let dir = scratch();
        let marker = dir.path().join("built");
        let mut spec = spec(dir.path());
        spec.pre_cmds = vec![line("false")];
        spec.post_cmds = vec![line("no-such-hotrack-command")];
        spec.build = Some(line(&format!("touch {}", marker.display())));
        let manager = LifecycleManager::new(spec);

        manager.restart().await.unwrap();
        assert!(marker.exists());
        assert!(manager.is_running());
        manager.stop().await;
    }

    #[tokio::test]
    async fn start_twice_reports_already_running() {
        let dir = scratch();
        let manager = LifecycleManager::new(spec(dir.path()));
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(LifecycleError::AlreadyRunning)));
        manager.stop().await;
    }

    #[tokio::test]
    async fn missing_run_target_is_skipped() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.run = None;
        let manager = LifecycleManager::new(spec);
        manager.restart().await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_start_error() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.run = Some(RunTarget::CommandLine(line("/nonexistent/hotrack-binary")));
        let manager = LifecycleManager::new(spec);
        let err = manager.restart().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Start(CommandError::Spawn { .. })));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn reaper_clears_state_when_process_exits() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.run = Some(RunTarget::CommandLine(line("true")));
        let manager = LifecycleManager::new(spec);
        manager.start().unwrap();
        assert!(wait_until(|| !manager.is_running(), Duration::from_secs(2)).await);
        assert_eq!(manager.phase(), LifecyclePhase::Idle);
    }

    #[tokio::test]
    async fn env_overlay_reaches_the_process() {
        let dir = scratch();
        let out = dir.path().join("env.txt");
        let mut spec = spec(dir.path());
        spec.env
            .insert("HOTRACK_TEST_VALUE".to_string(), "overlay".to_string());
        spec.run = Some(shell(&format!(
            "echo \"$HOTRACK_TEST_VALUE\" > {}; exec sleep 30",
            out.display()
        )));
        let manager = LifecycleManager::new(spec);
        manager.start().unwrap();

        assert!(wait_until(|| out.exists(), Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "overlay");
        manager.stop().await;
    }

    #[tokio::test]
    async fn stop_force_kills_processes_ignoring_sigterm() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.run = Some(shell("trap '' TERM; exec sleep 30"));
        let grace = Duration::from_millis(500);
        let manager = LifecycleManager::new(spec).with_grace(grace);
        manager.start().unwrap();
        let pid = manager.pid().unwrap();
        // Let the shell install its trap before we signal it.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        manager.stop().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= grace, "stopped too early: {:?}", elapsed);
        assert!(elapsed < grace + Duration::from_secs(2), "took {:?}", elapsed);
        assert!(!manager.is_running());
        let group_alive = unsafe { libc::kill(-(pid as libc::pid_t), 0) == 0 };
        assert!(!group_alive);
    }

    #[tokio::test]
    async fn interrupt_signal_is_configurable() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        // Only SIGINT ends this one quickly.
        spec.run = Some(shell(
            "trap '' TERM; trap 'exit 0' INT; while :; do sleep 0.1; done",
        ));
        spec.stop_signal = Signal::Interrupt;
        let grace = Duration::from_secs(3);
        let manager = LifecycleManager::new(spec).with_grace(grace);
        manager.start().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let started = Instant::now();
        manager.stop().await;
        assert!(started.elapsed() < grace);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn concurrent_restarts_keep_a_single_process() {
        let dir = scratch();
        let pids = dir.path().join("pids");
        let mut spec = spec(dir.path());
        spec.run = Some(shell(&format!("echo $$ >> {}; exec sleep 30", pids.display())));
        let manager = Arc::new(LifecycleManager::new(spec).with_grace(Duration::from_secs(1)));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                let _ = manager.restart().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let current = manager.pid().expect("one process should be running");
        tokio::time::sleep(Duration::from_millis(200)).await;
        let started: Vec<u32> = std::fs::read_to_string(&pids)
            .unwrap()
            .lines()
            .filter_map(|l| l.trim().parse().ok())
            .collect();
        assert!(!started.is_empty());
        for pid in started {
            if pid != current {
                assert!(!pid_alive(pid), "stale process {} still alive", pid);
            }
        }

        manager.shutdown().await;
        assert!(!manager.is_running());
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);
        assert!(matches!(manager.restart().await, Err(LifecycleError::Closed)));
    }

    #[tokio::test]
    async fn clean_up_is_idempotent() {
        let dir = scratch();
        let artifact = dir.path().join("app-bin");
        let tmp_dir = dir.path().join("scratch");
        std::fs::create_dir(&tmp_dir).unwrap();
        std::fs::write(tmp_dir.join("junk"), b"x").unwrap();

        let mut spec = spec(dir.path());
        spec.build = Some(line(&format!("touch {}", artifact.display())));
        spec.run = Some(RunTarget::Binary {
            path: artifact.display().to_string(),
            args: Vec::new(),
        });
        spec.clean_on_exit = true;
        spec.tmp_dir = Some(tmp_dir.clone());
        let manager = LifecycleManager::new(spec);

        // The artifact is not executable, so start fails after the build.
        assert!(manager.restart().await.is_err());
        assert!(artifact.exists());

        manager.clean_up();
        assert!(!artifact.exists());
        assert!(!tmp_dir.exists());
        manager.clean_up();
    }

    #[tokio::test]
    async fn undecodable_output_does_not_break_the_pipe() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.run = Some(shell("printf 'caf\\351\\n'; sleep 0.5; echo after; exec sleep 30"));
        let manager = LifecycleManager::new(spec);
        manager.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(manager.is_running());
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn kill_now_ends_processes_ignoring_sigterm() {
        let dir = scratch();
        let mut spec = spec(dir.path());
        spec.run = Some(shell("trap '' TERM; exec sleep 30"));
        let manager = LifecycleManager::new(spec).with_grace(Duration::from_secs(30));
        manager.start().unwrap();
        let pid = manager.pid().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        manager.kill_now();
        assert!(wait_until(|| !manager.is_running(), Duration::from_secs(2)).await);
        assert!(!pid_alive(pid));
        manager.kill_now();
    }

    #[test]
    fn removable_dir_guard() {
        assert!(!is_removable_dir(Path::new("/")));
        assert!(!is_removable_dir(Path::new(".")));
        assert!(!is_removable_dir(Path::new("")));
        assert!(!is_removable_dir(&std::env::temp_dir()));
        assert!(!is_removable_dir(&std::env::current_dir().unwrap()));
        assert!(is_removable_dir(&std::env::temp_dir().join("hotrack-scratch")));
    }
}
