//! Caddy process lifecycle supervision.
//!
//! The supervisor owns exactly one proxy process at a time and serializes
//! all lifecycle transitions behind a mutex:
//!
//! `Stopped -> Starting -> Running -> (Stopping -> Stopped | Crashed -> Starting)`
//!
//! Readiness is detected by polling the Caddy admin endpoint rather than
//! matching log output; graceful shutdown goes through the admin API with a
//! bounded escalation to SIGKILL.

use crate::caddyfile::ConfigDocument;
use crate::config::SupervisorSettings;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle state of the supervised proxy process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Why the proxy failed to reach `Running`.
#[derive(Debug)]
pub enum StartupError {
    /// The process could not be spawned (or its config could not be
    /// materialized on disk).
    ExecFailure(std::io::Error),
    /// The process spawned but exited before reporting ready.
    ConfigRejected { status: ExitStatus, stderr: String },
    /// The readiness deadline elapsed without the proxy reporting ready.
    Timeout(Duration),
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExecFailure(e) => write!(f, "Failed to launch proxy process: {}", e),
            Self::ConfigRejected { status, stderr } => {
                write!(f, "Proxy exited during startup ({})", status)?;
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            Self::Timeout(deadline) => {
                write!(f, "Proxy did not report ready within {:?}", deadline)
            }
        }
    }
}

impl std::error::Error for StartupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ExecFailure(e) => Some(e),
            _ => None,
        }
    }
}

/// The proxy exited unexpectedly while Running and the restart budget is
/// exhausted. Fatal to `run_blocking()`; never retried silently.
#[derive(Debug)]
pub struct CrashError {
    pub status: ExitStatus,
}

impl fmt::Display for CrashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Proxy process exited unexpectedly ({})", self.status)
    }
}

impl std::error::Error for CrashError {}

/// Everything owned about the one live proxy process. Exclusively held
/// behind the supervisor's mutex; never shared.
struct ProcessHandle {
    state: LifecycleState,
    child: Option<Child>,
    /// Holds the generated Caddyfile for the lifetime of the process.
    config_dir: Option<TempDir>,
    /// Admin stop URL of the live process, taken from its config document.
    stop_url: Option<String>,
    last_exit: Option<ExitStatus>,
}

impl ProcessHandle {
    fn new() -> Self {
        Self {
            state: LifecycleState::Stopped,
            child: None,
            config_dir: None,
            stop_url: None,
            last_exit: None,
        }
    }

    fn clear(&mut self, state: LifecycleState) {
        self.child = None;
        self.config_dir = None;
        self.stop_url = None;
        self.state = state;
    }
}

/// Starts, monitors and stops the Caddy process.
///
/// `start`/`stop` serialize through an internal mutex (at most one
/// transition in flight); the mutex guard is held across the readiness
/// wait, so concurrent callers observe completed transitions only.
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    http: reqwest::Client,
    handle: Mutex<ProcessHandle>,
}

impl ProcessSupervisor {
    /// Create a supervisor in the Stopped state.
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            http: reqwest::Client::new(),
            handle: Mutex::new(ProcessHandle::new()),
        }
    }

    /// Get the settings in effect.
    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> LifecycleState {
        self.handle.lock().await.state
    }

    /// Exit status of the most recently ended proxy process, if any.
    pub async fn last_exit(&self) -> Option<ExitStatus> {
        self.handle.lock().await.last_exit
    }

    /// Launch the proxy with the given config and wait until it reports
    /// ready or the startup deadline elapses.
    ///
    /// No-op when the proxy is already Running. On any failure the handle
    /// ends Stopped with no live child process.
    pub async fn start(&self, document: &ConfigDocument) -> Result<(), StartupError> {
        let mut handle = self.handle.lock().await;
        if handle.state == LifecycleState::Running {
            debug!("start() called while already running, ignoring");
            return Ok(());
        }

        handle.state = LifecycleState::Starting;

        let materialized = tempfile::tempdir().and_then(|dir| {
            let path = dir.path().join("Caddyfile");
            std::fs::write(&path, document.as_str())?;
            Ok((dir, path))
        });
        let (dir, config_path) = match materialized {
            Ok(pair) => pair,
            Err(e) => {
                handle.clear(LifecycleState::Stopped);
                return Err(StartupError::ExecFailure(e));
            }
        };

        info!(
            binary = %self.settings.caddy_binary.display(),
            config = %config_path.display(),
            "launching proxy"
        );

        let mut cmd = Command::new(&self.settings.caddy_binary);
        cmd.arg("run")
            .arg("--config")
            .arg(&config_path)
            .args(["--adapter", "caddyfile"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                handle.clear(LifecycleState::Stopped);
                return Err(StartupError::ExecFailure(e));
            }
        };
        handle.child = Some(child);
        handle.config_dir = Some(dir);
        handle.stop_url = Some(document.stop_url());

        let readiness_url = document.readiness_url();
        let deadline = Instant::now() + self.settings.startup_timeout;
        loop {
            if let Some(child) = handle.child.as_mut()
                && let Ok(Some(status)) = child.try_wait()
            {
                let stderr = drain_stderr(child).await;
                handle.last_exit = Some(status);
                handle.clear(LifecycleState::Stopped);
                return Err(StartupError::ConfigRejected { status, stderr });
            }

            if self.probe_ready(&readiness_url).await {
                handle.state = LifecycleState::Running;
                info!("proxy is ready");
                return Ok(());
            }

            if Instant::now() >= deadline {
                if let Some(mut child) = handle.child.take() {
                    let _ = child.start_kill();
                    if let Ok(status) = child.wait().await {
                        handle.last_exit = Some(status);
                    }
                }
                handle.clear(LifecycleState::Stopped);
                return Err(StartupError::Timeout(self.settings.startup_timeout));
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Stop the proxy: graceful stop request first, then a bounded wait,
    /// then SIGKILL. Always ends Stopped; calling `stop()` on a Stopped
    /// handle is a no-op.
    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        let Some(mut child) = handle.child.take() else {
            handle.clear(LifecycleState::Stopped);
            return;
        };
        let stop_url = handle.stop_url.take();

        handle.state = LifecycleState::Stopping;
        info!("stopping proxy");

        // Graceful shutdown through the admin API; a dead admin endpoint
        // just means we escalate sooner.
        if let Some(url) = stop_url {
            let _ = self
                .http
                .post(url)
                .timeout(Duration::from_secs(2))
                .send()
                .await;
        }

        match tokio::time::timeout(self.settings.grace_period, child.wait()).await {
            Ok(Ok(status)) => {
                handle.last_exit = Some(status);
                info!(%status, "proxy exited gracefully");
            }
            Ok(Err(e)) => {
                warn!("failed waiting for proxy exit: {}", e);
            }
            Err(_) => {
                warn!(
                    "proxy did not exit within {:?}, killing",
                    self.settings.grace_period
                );
                let _ = child.start_kill();
                if let Ok(status) = child.wait().await {
                    handle.last_exit = Some(status);
                }
            }
        }

        handle.clear(LifecycleState::Stopped);
    }

    /// Run the proxy alongside the application's own serving loop.
    ///
    /// Starts the proxy, then drives `app` until it completes, the process
    /// crashes, or an interrupt arrives. Every exit path — including an
    /// interrupt while `start()` is still waiting for readiness — goes
    /// through `stop()`, so no proxy process survives the application.
    ///
    /// A crash while Running consumes the configured restart budget before
    /// being surfaced as a fatal [`CrashError`].
    pub async fn run_blocking<F>(&self, document: &ConfigDocument, app: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        tokio::select! {
            res = self.start(document) => {
                if let Err(e) = res {
                    self.stop().await;
                    return Err(e.into());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted during proxy startup, cleaning up");
                self.stop().await;
                anyhow::bail!("interrupted while waiting for proxy readiness");
            }
        }

        tokio::pin!(app);
        let mut restarts_left = self.settings.max_restarts;
        let result = loop {
            tokio::select! {
                res = &mut app => {
                    debug!("application serving loop finished");
                    break res;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, shutting down");
                    break Ok(());
                }
                status = self.wait_for_exit() => {
                    if restarts_left == 0 {
                        break Err(CrashError { status }.into());
                    }
                    restarts_left -= 1;
                    warn!(%status, restarts_left, "proxy crashed, restarting");
                    if let Err(e) = self.start(document).await {
                        break Err(e.into());
                    }
                }
            }
        };

        self.stop().await;
        result
    }

    /// Resolve once the Running proxy process exits on its own; pends
    /// forever otherwise. Marks the handle Crashed.
    async fn wait_for_exit(&self) -> ExitStatus {
        loop {
            {
                let mut handle = self.handle.lock().await;
                if handle.state == LifecycleState::Running
                    && let Some(child) = handle.child.as_mut()
                    && let Ok(Some(status)) = child.try_wait()
                {
                    handle.last_exit = Some(status);
                    handle.clear(LifecycleState::Crashed);
                    return status;
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn probe_ready(&self, readiness_url: &str) -> bool {
        self.http
            .get(readiness_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut buf = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut buf).await;
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caddyfile::generate;
    use crate::config::ProxyConfig;
    use std::path::PathBuf;
    use tokio::io::AsyncWriteExt;

    fn test_document() -> ConfigDocument {
        generate(&ProxyConfig::new("myapp", "example", 10800)).unwrap()
    }

    fn test_document_with_admin(admin: &str) -> ConfigDocument {
        generate(&ProxyConfig::new("myapp", "example", 10800).with_admin_address(admin)).unwrap()
    }

    fn fast_settings() -> SupervisorSettings {
        SupervisorSettings {
            startup_timeout: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// Write an executable stand-in for the proxy binary that ignores its
    /// arguments (Caddy-style flags would confuse real utilities).
    #[cfg(unix)]
    fn fake_proxy(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-proxy");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Minimal HTTP responder standing in for the Caddy admin endpoint.
    async fn spawn_fake_admin() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_on_stopped_handle() {
        let supervisor = ProcessSupervisor::new(fast_settings());
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);

        supervisor.stop().await;
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);

        supervisor.stop().await;
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_start_with_unspawnable_binary_is_exec_failure() {
        let settings = SupervisorSettings {
            caddy_binary: PathBuf::from("/nonexistent/caddytail-test-binary"),
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);

        let err = supervisor.start(&test_document()).await.unwrap_err();
        assert!(matches!(err, StartupError::ExecFailure(_)));
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_with_immediately_exiting_binary_is_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SupervisorSettings {
            caddy_binary: fake_proxy(dir.path(), "echo 'bad config' >&2; exit 1"),
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);

        // Nothing listens on the admin port, so readiness can never be
        // observed.
        let document = test_document_with_admin("127.0.0.1:1");
        let err = supervisor.start(&document).await.unwrap_err();
        match err {
            StartupError::ConfigRejected { status, stderr } => {
                assert!(!status.success());
                assert!(stderr.contains("bad config"));
            }
            other => panic!("expected ConfigRejected, got {:?}", other),
        }
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
        assert!(supervisor.last_exit().await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_times_out_when_readiness_never_observed() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SupervisorSettings {
            caddy_binary: fake_proxy(dir.path(), "sleep 30"),
            startup_timeout: Duration::from_millis(300),
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);

        let document = test_document_with_admin("127.0.0.1:1");
        let err = supervisor.start(&document).await.unwrap_err();
        assert!(matches!(err, StartupError::Timeout(_)));
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_then_stop_reaches_running_and_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let admin = spawn_fake_admin().await;
        let settings = SupervisorSettings {
            caddy_binary: fake_proxy(dir.path(), "sleep 30"),
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);
        let document = test_document_with_admin(&admin);

        supervisor.start(&document).await.unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Running);

        // Second start is a no-op while running.
        supervisor.start(&document).await.unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Running);

        // The fake admin cannot actually stop the child, so this exercises
        // the grace-period escalation path too.
        supervisor.stop().await;
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
        assert!(supervisor.last_exit().await.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_blocking_returns_when_app_completes() {
        let dir = tempfile::tempdir().unwrap();
        let admin = spawn_fake_admin().await;
        let settings = SupervisorSettings {
            caddy_binary: fake_proxy(dir.path(), "sleep 30"),
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);

        supervisor
            .run_blocking(&test_document_with_admin(&admin), async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_blocking_surfaces_crash_as_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let admin = spawn_fake_admin().await;
        let settings = SupervisorSettings {
            caddy_binary: fake_proxy(dir.path(), "sleep 0.4"),
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);

        let err = supervisor
            .run_blocking(
                &test_document_with_admin(&admin),
                std::future::pending::<anyhow::Result<()>>(),
            )
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<CrashError>().is_some());
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_blocking_restarts_within_budget_before_fatal_crash() {
        let dir = tempfile::tempdir().unwrap();
        let admin = spawn_fake_admin().await;
        // Each launch records itself before exiting, so the file counts
        // how many times the supervisor spawned the proxy.
        let launches = dir.path().join("launches");
        let settings = SupervisorSettings {
            caddy_binary: fake_proxy(
                dir.path(),
                &format!("echo up >> {}; sleep 0.4", launches.display()),
            ),
            max_restarts: 1,
            ..fast_settings()
        };
        let supervisor = ProcessSupervisor::new(settings);

        let err = supervisor
            .run_blocking(
                &test_document_with_admin(&admin),
                std::future::pending::<anyhow::Result<()>>(),
            )
            .await
            .unwrap_err();

        // One restart was consumed before the second crash became fatal.
        assert!(err.downcast_ref::<CrashError>().is_some());
        let recorded = std::fs::read_to_string(&launches).unwrap();
        assert_eq!(recorded.lines().count(), 2);
        assert_eq!(supervisor.state().await, LifecycleState::Stopped);
    }
}
