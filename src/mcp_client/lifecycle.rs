//! Worker process lifecycle management.
//!
//! The [`ProcessSupervisor`] owns the single worker subprocess and its state
//! machine:
//!
//! ```text
//! NotStarted --spawn--> Starting --readiness line--> Ready
//! Starting|Ready --unexpected exit--> Crashed --delay--> Starting
//! any --restart()--> Restarting --kill, spawn--> Starting
//! any --shutdown()--> Stopped
//! ```
//!
//! Every transition goes through one async mutex, so at most one spawn,
//! kill or restart is in flight at a time. Background tasks (output
//! readers, the exit monitor, scheduled restarts) carry the generation
//! number of the process they belong to and are ignored once a newer
//! process has replaced it.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::WorkerConfig;

use super::catalog::{CapabilityCatalog, CatalogSource};
use super::errors::BridgeError;
use super::transport::{read_lines, FrameDisposition, RpcTransport};
use super::types::{ProcessState, SessionCredentials};

// ─── Status ─────────────────────────────────────────────────────────────────

/// Point-in-time view of the worker process.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub consecutive_crashes: u32,
    pub last_started_at: Option<DateTime<Utc>>,
    pub pending_requests: usize,
}

// ─── Internal State ─────────────────────────────────────────────────────────

/// A spawned worker and the handles needed to stop it.
struct RunningWorker {
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

/// State guarded by the transition mutex.
#[derive(Default)]
struct Control {
    worker: Option<RunningWorker>,
    restart_task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RunInfo {
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
}

struct Inner {
    config: WorkerConfig,
    transport: Arc<RpcTransport>,
    catalog: Arc<CapabilityCatalog>,
    state_tx: watch::Sender<ProcessState>,
    control: tokio::sync::Mutex<Control>,
    generation: AtomicU64,
    restart_count: AtomicU32,
    consecutive_crashes: AtomicU32,
    run_info: Mutex<RunInfo>,
    credentials: Mutex<Option<SessionCredentials>>,
}

// ─── ProcessSupervisor ──────────────────────────────────────────────────────

/// Owns the worker subprocess, its transport and its capability catalog.
///
/// Cheap to clone; clones share the same process.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Create a supervisor in `NotStarted`. Nothing is spawned until
    /// [`start`](Self::start).
    pub fn new(config: WorkerConfig) -> Self {
        let transport = Arc::new(RpcTransport::new(&config.name, config.request_timeout()));
        let (state_tx, _) = watch::channel(ProcessState::NotStarted);

        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                catalog: Arc::new(CapabilityCatalog::new()),
                state_tx,
                control: tokio::sync::Mutex::new(Control::default()),
                generation: AtomicU64::new(0),
                restart_count: AtomicU32::new(0),
                consecutive_crashes: AtomicU32::new(0),
                run_info: Mutex::new(RunInfo::default()),
                credentials: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> Arc<RpcTransport> {
        self.inner.transport.clone()
    }

    pub fn catalog(&self) -> Arc<CapabilityCatalog> {
        self.inner.catalog.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProcessState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the state satisfies `predicate`.
    ///
    /// Returns the matching state, or `Err(current)` if `timeout` elapses.
    pub async fn wait_for_state<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<ProcessState, ProcessState>
    where
        F: Fn(ProcessState) -> bool,
    {
        let mut rx = self.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|s| predicate(*s))).await;
        match waited {
            Ok(Ok(state)) => Ok(*state),
            _ => Err(self.state()),
        }
    }

    /// Snapshot for health checks.
    pub fn status(&self) -> WorkerStatus {
        let info = lock(&self.inner.run_info);
        WorkerStatus {
            worker: self.inner.config.name.clone(),
            state: self.state(),
            pid: info.pid,
            restart_count: self.inner.restart_count.load(Ordering::Relaxed),
            consecutive_crashes: self.inner.consecutive_crashes.load(Ordering::Relaxed),
            last_started_at: info.started_at,
            pending_requests: self.inner.transport.pending_count(),
        }
    }

    // ─── Transitions ─────────────────────────────────────────────────────

    /// Spawn the worker. A no-op when a worker is already running.
    ///
    /// A spawn failure is returned to the caller *and* handled like a crash,
    /// so the restart policy still applies.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut control = self.inner.control.lock().await;
        self.inner.ensure_not_stopped()?;
        if control.worker.is_some() {
            return Ok(());
        }
        self.inner.spawn_worker(&mut control)
    }

    /// Kill the current worker immediately and spawn a fresh one.
    pub async fn restart(&self) -> Result<(), BridgeError> {
        let mut control = self.inner.control.lock().await;
        self.inner.ensure_not_stopped()?;

        tracing::info!(worker = %self.inner.config.name, "manual worker restart");
        cancel_restart_task(&mut control);
        self.inner.set_state(ProcessState::Restarting);
        self.inner.kill_current(&mut control).await;
        self.inner.transport.detach("worker restarting");
        self.inner.restart_count.fetch_add(1, Ordering::Relaxed);

        self.inner.spawn_worker(&mut control)
    }

    /// Replace the session credentials and respawn so the worker sees them.
    pub async fn restart_with_credentials(
        &self,
        credentials: Option<SessionCredentials>,
    ) -> Result<(), BridgeError> {
        *lock(&self.inner.credentials) = credentials;
        self.restart().await
    }

    /// Kill the worker and stop supervising. Terminal.
    pub async fn shutdown(&self) {
        let mut control = self.inner.control.lock().await;
        if self.state() == ProcessState::Stopped {
            return;
        }

        cancel_restart_task(&mut control);
        self.inner.set_state(ProcessState::Stopped);
        self.inner.kill_current(&mut control).await;
        self.inner.transport.detach("worker stopped");
        lock(&self.inner.run_info).pid = None;

        tracing::info!(worker = %self.inner.config.name, "worker stopped");
    }
}

impl Inner {
    fn set_state(&self, next: ProcessState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            tracing::debug!(worker = %self.config.name, from = %prev, to = %next, "worker state");
        }
    }

    fn ensure_not_stopped(&self) -> Result<(), BridgeError> {
        if *self.state_tx.borrow() == ProcessState::Stopped {
            return Err(BridgeError::Stopped {
                name: self.config.name.clone(),
            });
        }
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn is_readiness_line(&self, line: &str) -> bool {
        self.config
            .readiness_markers
            .iter()
            .any(|marker| !marker.is_empty() && line.contains(marker.as_str()))
    }

    // ─── Spawning ────────────────────────────────────────────────────────

    /// Spawn a new worker process. Caller holds the transition mutex.
    fn spawn_worker(self: &Arc<Self>, control: &mut Control) -> Result<(), BridgeError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.set_state(ProcessState::Starting);

        let mut child = match self.build_command().spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{e}");
                tracing::error!(
                    worker = %self.config.name,
                    command = %self.config.command,
                    error = %reason,
                    "failed to spawn worker"
                );
                self.handle_crash(control, generation, &reason);
                return Err(BridgeError::SpawnFailed {
                    name: self.config.name.clone(),
                    reason,
                });
            }
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let reason = "failed to capture worker stdio".to_string();
                let _ = child.start_kill();
                self.handle_crash(control, generation, &reason);
                return Err(BridgeError::SpawnFailed {
                    name: self.config.name.clone(),
                    reason,
                });
            }
        };
        let stderr = child.stderr.take();

        let pid = child.id();
        {
            let mut info = lock(&self.run_info);
            info.pid = pid;
            info.started_at = Some(Utc::now());
        }
        tracing::info!(worker = %self.config.name, pid = ?pid, generation, "worker spawned");

        self.transport.attach(stdin);
        self.spawn_output_reader(generation, stdout, true);
        if let Some(stderr) = stderr {
            self.spawn_output_reader(generation, stderr, false);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = self.spawn_monitor(generation, child, kill_rx);
        control.worker = Some(RunningWorker {
            generation,
            kill_tx: Some(kill_tx),
            monitor,
        });

        if self.config.readiness_markers.is_empty() {
            self.become_ready(generation);
        }

        Ok(())
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(creds) = lock(&self.credentials).as_ref() {
            for (key, value) in creds.to_env() {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = self.config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Pump one output stream. Stdout lines go to the transport; both
    /// streams are scanned for the readiness marker.
    fn spawn_output_reader<R>(self: &Arc<Self>, generation: u64, stream: R, is_stdout: bool)
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let inner = self.clone();
        tokio::spawn(async move {
            let mut ready_seen = false;
            let result = read_lines(stream, |line| {
                let diagnostic = if is_stdout {
                    inner.transport.handle_line(&line) == FrameDisposition::Diagnostic
                } else {
                    tracing::debug!(worker = %inner.config.name, line = %line.trim_end(), "worker stderr");
                    true
                };

                if diagnostic && !ready_seen && inner.is_readiness_line(&line) {
                    ready_seen = true;
                    let inner = inner.clone();
                    tokio::spawn(async move { inner.mark_ready(generation).await });
                }
            })
            .await;

            if let Err(e) = result {
                tracing::warn!(
                    worker = %inner.config.name,
                    stream = if is_stdout { "stdout" } else { "stderr" },
                    error = %e,
                    "worker output read failed"
                );
            }
        });
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        generation: u64,
        mut child: Child,
        kill_rx: oneshot::Receiver<()>,
    ) -> JoinHandle<()> {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    let reason = match status {
                        Ok(status) => format!("process exited ({status})"),
                        Err(e) => format!("failed to wait on process: {e}"),
                    };
                    // Handled on a separate task: the transition mutex may be
                    // held by a caller that is waiting for this monitor.
                    tokio::spawn(async move { inner.on_unexpected_exit(generation, reason).await });
                }
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(worker = %inner.config.name, error = %e, "failed to kill worker");
                    }
                }
            }
        })
    }

    // ─── Event Handlers ──────────────────────────────────────────────────

    async fn mark_ready(self: Arc<Self>, generation: u64) {
        let _control = self.control.lock().await;
        if !self.is_current(generation) || *self.state_tx.borrow() != ProcessState::Starting {
            return;
        }
        self.become_ready(generation);
    }

    /// Enter `Ready` and run the handshake in the background. Caller holds
    /// the transition mutex.
    fn become_ready(self: &Arc<Self>, generation: u64) {
        self.set_state(ProcessState::Ready);
        self.consecutive_crashes.store(0, Ordering::Relaxed);
        tracing::info!(worker = %self.config.name, generation, "worker ready");

        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = CapabilityCatalog::handshake(&inner.transport).await;
            if !inner.is_current(generation) {
                tracing::debug!(worker = %inner.config.name, generation, "discarding stale handshake");
                return;
            }
            match outcome {
                Ok(tools) => {
                    tracing::info!(
                        worker = %inner.config.name,
                        tool_count = tools.len(),
                        "capability catalog populated"
                    );
                    inner.catalog.replace(CatalogSource::Dynamic, tools);
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %inner.config.name,
                        error = %e,
                        "handshake failed, using static tool catalog"
                    );
                    inner.catalog.install_fallback();
                }
            }
        });
    }

    async fn on_unexpected_exit(self: Arc<Self>, generation: u64, reason: String) {
        let mut control = self.control.lock().await;
        if !self.is_current(generation) || *self.state_tx.borrow() == ProcessState::Stopped {
            return;
        }
        if control.worker.as_ref().map(|w| w.generation) == Some(generation) {
            control.worker = None;
        }

        lock(&self.run_info).pid = None;
        let rejected = self.transport.detach(&reason);
        tracing::warn!(
            worker = %self.config.name,
            generation,
            reason = %reason,
            rejected_requests = rejected,
            "worker crashed"
        );
        self.handle_crash(&mut control, generation, &reason);
    }

    /// Enter `Crashed` and schedule a restart per the configured policy.
    /// Caller holds the transition mutex.
    fn handle_crash(self: &Arc<Self>, control: &mut Control, generation: u64, reason: &str) {
        self.set_state(ProcessState::Crashed);
        let crashes = self.consecutive_crashes.fetch_add(1, Ordering::Relaxed) + 1;

        let Some(delay) = self.config.restart.delay_for(crashes) else {
            tracing::error!(
                worker = %self.config.name,
                consecutive_crashes = crashes,
                reason,
                "restart limit reached, worker stays down"
            );
            return;
        };

        tracing::info!(
            worker = %self.config.name,
            delay_ms = delay.as_millis() as u64,
            consecutive_crashes = crashes,
            "scheduling worker restart"
        );

        cancel_restart_task(control);
        let inner = self.clone();
        control.restart_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.restart_after_crash(generation).await;
        }));
    }

    async fn restart_after_crash(self: Arc<Self>, generation: u64) {
        let mut control = self.control.lock().await;
        if !self.is_current(generation) || *self.state_tx.borrow() != ProcessState::Crashed {
            return;
        }
        // This task is the one stored in `restart_task`; drop the handle
        // without aborting it.
        control.restart_task = None;
        self.restart_count.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.spawn_worker(&mut control) {
            tracing::warn!(worker = %self.config.name, error = %e, "scheduled restart failed");
        }
    }

    /// Forcefully stop the current worker and wait for it to die.
    async fn kill_current(&self, control: &mut Control) {
        let Some(mut worker) = control.worker.take() else {
            return;
        };
        if let Some(tx) = worker.kill_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut worker.monitor).await;
    }
}

fn cancel_restart_task(control: &mut Control) {
    if let Some(task) = control.restart_task.take() {
        task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestartConfig;
    use std::collections::HashMap;

    fn sh_worker(script: &str, restart: RestartConfig) -> WorkerConfig {
        WorkerConfig {
            name: "test-worker".into(),
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: HashMap::new(),
            cwd: None,
            readiness_markers: vec!["MCP server ready".into()],
            request_timeout_ms: 200,
            restart,
        }
    }

    fn fixed(delay_ms: u64) -> RestartConfig {
        RestartConfig::Fixed { delay_ms }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_new_supervisor_is_not_started() {
        let sup = ProcessSupervisor::new(sh_worker("true", fixed(100)));
        assert_eq!(sup.state(), ProcessState::NotStarted);
        assert!(!sup.transport().is_attached());
        assert!(sup.catalog().snapshot().is_empty());
        let status = sup.status();
        assert_eq!(status.restart_count, 0);
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn test_readiness_marker_moves_to_ready_and_installs_fallback() {
        // Prints the marker but never answers the handshake.
        let sup = ProcessSupervisor::new(sh_worker("echo 'MCP server ready'; exec sleep 30", fixed(100)));
        sup.start().await.unwrap();

        let state = sup
            .wait_for_state(|s| s == ProcessState::Ready, WAIT)
            .await
            .unwrap();
        assert_eq!(state, ProcessState::Ready);
        assert!(sup.status().pid.is_some());

        let catalog = sup.catalog();
        let deadline = tokio::time::Instant::now() + WAIT;
        while catalog.snapshot().source() != CatalogSource::StaticFallback {
            assert!(tokio::time::Instant::now() < deadline, "fallback never installed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        sup.shutdown().await;
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_empty_marker_list_is_ready_on_spawn() {
        let mut config = sh_worker("exec sleep 30", fixed(100));
        config.readiness_markers.clear();
        let sup = ProcessSupervisor::new(config);
        sup.start().await.unwrap();
        assert_eq!(sup.state(), ProcessState::Ready);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_killed_worker_crashes_then_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("started");
        // Only the first run announces readiness, so the restarted process
        // stays in Starting where the test can observe it.
        let script = format!(
            "if [ ! -f '{flag}' ]; then touch '{flag}'; echo 'MCP server ready'; fi; exec sleep 30",
            flag = flag.display()
        );
        let sup = ProcessSupervisor::new(sh_worker(&script, fixed(300)));
        sup.start().await.unwrap();
        sup.wait_for_state(|s| s == ProcessState::Ready, WAIT)
            .await
            .unwrap();

        let pid = sup.status().pid.expect("worker pid");
        let killed = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(killed.success());

        sup.wait_for_state(|s| s == ProcessState::Crashed, WAIT)
            .await
            .unwrap();
        assert!(!sup.transport().is_attached());

        sup.wait_for_state(|s| s == ProcessState::Starting, WAIT)
            .await
            .unwrap();
        let status = sup.status();
        assert_eq!(status.restart_count, 1);
        assert!(status.pid.is_some());
        assert_ne!(status.pid, Some(pid));

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_treated_as_crash() {
        let mut config = sh_worker("", fixed(60_000));
        config.command = "/nonexistent/toolbridge-worker".into();
        let sup = ProcessSupervisor::new(config);

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::SpawnFailed { .. }));
        assert_eq!(sup.state(), ProcessState::Crashed);
        assert_eq!(sup.status().consecutive_crashes, 1);

        sup.shutdown().await;
        assert_eq!(sup.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_backoff_policy_gives_up_after_limit() {
        let config = sh_worker(
            "exit 1",
            RestartConfig::Backoff {
                delay_ms: 20,
                max_delay_ms: 40,
                max_consecutive_crashes: 2,
            },
        );
        let sup = ProcessSupervisor::new(config);
        sup.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + WAIT;
        while sup.status().consecutive_crashes < 3 {
            assert!(tokio::time::Instant::now() < deadline, "crash limit never reached");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // No further restart is scheduled past the limit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sup.state(), ProcessState::Crashed);
        assert_eq!(sup.status().restart_count, 2);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_restart_spawns_new_process() {
        let sup = ProcessSupervisor::new(sh_worker("echo 'MCP server ready'; exec sleep 30", fixed(100)));
        sup.start().await.unwrap();
        sup.wait_for_state(|s| s == ProcessState::Ready, WAIT)
            .await
            .unwrap();
        let first_pid = sup.status().pid;

        sup.restart().await.unwrap();
        sup.wait_for_state(|s| s == ProcessState::Ready, WAIT)
            .await
            .unwrap();

        let status = sup.status();
        assert_ne!(status.pid, first_pid);
        assert_eq!(status.restart_count, 1);
        // The killed process must not be reported as a crash.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sup.state(), ProcessState::Ready);

        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_terminal() {
        let sup = ProcessSupervisor::new(sh_worker("exec sleep 30", fixed(100)));
        sup.start().await.unwrap();
        sup.shutdown().await;

        assert_eq!(sup.state(), ProcessState::Stopped);
        assert!(matches!(sup.start().await, Err(BridgeError::Stopped { .. })));
        assert!(matches!(sup.restart().await, Err(BridgeError::Stopped { .. })));
    }

    #[tokio::test]
    async fn test_credentials_are_injected_into_worker_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("token");
        let script = format!(
            "printf '%s' \"$GOOGLE_ACCESS_TOKEN\" > '{}'; echo 'MCP server ready'; exec sleep 30",
            out.display()
        );
        let sup = ProcessSupervisor::new(sh_worker(&script, fixed(100)));
        sup.start().await.unwrap();
        sup.wait_for_state(|s| s == ProcessState::Ready, WAIT)
            .await
            .unwrap();

        sup.restart_with_credentials(Some(SessionCredentials {
            access_token: "tok-123".into(),
            refresh_token: None,
            id_token: None,
            expires_at: None,
        }))
        .await
        .unwrap();
        sup.wait_for_state(|s| s == ProcessState::Ready, WAIT)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "tok-123");
        sup.shutdown().await;
    }
}
