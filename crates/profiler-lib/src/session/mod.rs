//! Ephemeral pprof sessions
//!
//! Two kinds of subprocess work against the external `go tool pprof`:
//! - interactive sessions serving the pprof web UI on an allocated local
//!   port, killed when their timeout elapses
//! - one-shot captures that write a compressed profile to disk
//!
//! Ports come from a counter seeded at construction; every allocation is
//! strictly greater than the previous one and ports are never reused.


use crate::artifacts::artifact_output_path;
use crate::models::ProfileSource;
use crate::observability::ProfilerMetrics;
use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long to wait for output pipes after an abnormal exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors returned synchronously to session callers
#[derive(Debug, Error)]
pub enum SessionError {
    /// The pprof subprocess could not be started
    #[error("failed to start pprof: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// A capture did not produce an artifact
    #[error("capture failed: {0}")]
    CaptureFailed(String),

    /// The port counter ran past the valid port range
    #[error("no session ports left")]
    PortsExhausted,
}

/// The pprof executable and the arguments preceding per-call flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PprofCommand {
    program: PathBuf,
    base_args: Vec<String>,
}

impl Default for PprofCommand {
    fn default() -> Self {
        Self::new("go", vec!["tool".to_string(), "pprof".to_string()])
    }
}

impl PprofCommand {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Parse a whitespace separated command line such as `go tool pprof`
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts.map(str::to_string).collect()))
    }

    /// The launcher leads its own process group so that helpers it forks
    /// (`go tool` runs pprof as a child) can be stopped with it
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }
}

/// An interactive session currently alive
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub port: u16,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Allocates session ports and supervises pprof subprocesses
pub struct SessionManager {
    next_port: AtomicU32,
    command: PprofCommand,
    sessions: Arc<DashMap<u16, SessionInfo>>,
    metrics: ProfilerMetrics,
}

impl SessionManager {
    /// The first allocated port is `base_port + 1`
    pub fn new(base_port: u16, command: PprofCommand) -> Self {
        Self {
            next_port: AtomicU32::new(u32::from(base_port)),
            command,
            sessions: Arc::new(DashMap::new()),
            metrics: ProfilerMetrics::new(),
        }
    }

    /// Allocate a port strictly greater than every previous allocation
    pub fn allocate_port(&self) -> Result<u16, SessionError> {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        u16::try_from(port).map_err(|_| SessionError::PortsExhausted)
    }

    /// Whether a session is currently serving on `port`
    pub fn is_active(&self, port: u16) -> bool {
        self.sessions.contains_key(&port)
    }

    /// Sessions whose subprocess is still running
    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.port);
        sessions
    }

    /// Start an interactive pprof web UI on a fresh port
    ///
    /// Returns as soon as the subprocess has started; the caller polls the
    /// port until it accepts connections. A detached task owns the process
    /// and kills it once `timeout` elapses. Failures after this returns are
    /// only logged.
    pub fn proxy(&self, timeout: Duration, source: &ProfileSource) -> Result<u16, SessionError> {
        let port = self.allocate_port()?;

        let mut command = self.command.command();
        command
            .arg("-http")
            .arg(format!("localhost:{port}"))
            .arg("-no_browser")
            .arg(source.to_arg())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn().map_err(SessionError::SpawnFailed)?;

        let started_at = Utc::now();
        let deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sessions.insert(
            port,
            SessionInfo {
                port,
                source: source.to_arg(),
                started_at,
                deadline,
            },
        );
        self.metrics.session_started();

        info!(
            port,
            source = %source,
            timeout_secs = timeout.as_secs(),
            "Started pprof session"
        );

        let guard = SessionGuard {
            port,
            sessions: self.sessions.clone(),
            metrics: self.metrics.clone(),
        };
        tokio::spawn(supervise(child, timeout, guard));

        Ok(port)
    }

    /// Capture `source` into `{dest_prefix}-{timestamp}.pb.gz`
    ///
    /// Blocks until pprof exits. Any sampling duration comes from the
    /// source itself. On failure no artifact is left behind.
    pub async fn persistent(
        &self,
        source: &ProfileSource,
        dest_prefix: &Path,
    ) -> Result<PathBuf, SessionError> {
        let output_path = artifact_output_path(dest_prefix, Local::now());

        let output = self
            .command
            .command()
            .arg("-proto")
            .arg("-output")
            .arg(&output_path)
            .arg(source.to_arg())
            .output()
            .await
            .map_err(|e| SessionError::CaptureFailed(format!("failed to start pprof: {e}")))?;

        if !output.status.success() {
            remove_partial(&output_path).await;
            return Err(SessionError::CaptureFailed(format!(
                "pprof exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if !tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            return Err(SessionError::CaptureFailed(format!(
                "pprof did not write {}",
                output_path.display()
            )));
        }

        debug!(source = %source, path = %output_path.display(), "Captured profile");
        Ok(output_path)
    }
}

/// Removes the session entry on every exit path of the supervisor,
/// including a panic
struct SessionGuard {
    port: u16,
    sessions: Arc<DashMap<u16, SessionInfo>>,
    metrics: ProfilerMetrics,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.port);
        self.metrics.session_finished();
        debug!(port = self.port, "Session released");
    }
}

/// Wait for the subprocess to exit or the deadline to pass
async fn supervise(mut child: Child, timeout: Duration, guard: SessionGuard) {
    let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_to_string(pipe)));
    let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_to_string(pipe)));

    let exit = tokio::select! {
        status = child.wait() => Some(status),
        _ = tokio::time::sleep(timeout) => None,
    };

    match exit {
        None => {
            debug!(port = guard.port, "Session deadline reached, stopping pprof");
            kill_process_group(&child, guard.port);
            if let Err(e) = child.kill().await {
                warn!(port = guard.port, error = %e, "Failed to kill pprof session");
            }
            abort(stdout);
            abort(stderr);
        }
        Some(Ok(status)) if status.success() => {
            debug!(port = guard.port, "pprof session exited");
        }
        Some(Ok(status)) => {
            guard.metrics.inc_session_failures();
            let stdout = collect(stdout).await;
            let stderr = collect(stderr).await;
            warn!(
                port = guard.port,
                status = %status,
                stdout = %stdout,
                stderr = %stderr,
                "pprof session exited abnormally"
            );
        }
        Some(Err(e)) => {
            guard.metrics.inc_session_failures();
            warn!(port = guard.port, error = %e, "Failed to wait for pprof session");
        }
    }
}

/// SIGKILL every process in the child's group; the unreaped leader keeps
/// the group id from being reused
#[cfg(unix)]
fn kill_process_group(child: &Child, port: u16) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        debug!(port, pgid = pid, error = %e, "Failed to signal pprof process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child, _port: u16) {}

async fn read_to_string<R: AsyncRead + Unpin>(mut pipe: R) -> String {
    let mut buf = Vec::new();
    let _ = pipe.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(reader: Option<JoinHandle<String>>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}

fn abort(reader: Option<JoinHandle<String>>) {
    if let Some(reader) = reader {
        reader.abort();
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial capture"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial capture"),
    }
}
