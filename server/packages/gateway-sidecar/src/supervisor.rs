//! Gateway Supervisor - owns the gateway subprocess for the sidecar's lifetime.
//!
//! The supervisor is idle until the first start trigger. That trigger moves it
//! from `NotStarted` to `Starting` exactly once and launches the restart loop,
//! which alternates between `Starting` and `Running` forever.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};

use crate::gateway_logs::{LogRecorder, LogStream};
use crate::persist::{normalize_gateway_config, write_private};

const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotStarted,
    Starting,
    Running,
}

impl SupervisorState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Starting,
            _ => Self::Running,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Starting => 1,
            Self::Running => 2,
        }
    }
}

/// What to run and what to hand it before each spawn.
#[derive(Debug, Clone)]
pub struct GatewayLaunch {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Forced as `HOME` for the gateway.
    pub home_dir: PathBuf,
    /// Configuration blob written to `config_path` before every spawn.
    pub config_blob: Option<String>,
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Pause after the gateway exits.
    pub exit_delay: Duration,
    /// Pause after the gateway could not be spawned at all.
    pub failure_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            exit_delay: Duration::from_secs(1),
            failure_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub poll_interval: Duration,
    pub dial_timeout: Duration,
    pub ceiling: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            dial_timeout: Duration::from_millis(500),
            ceiling: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub spawns: u64,
    pub config_present: bool,
}

#[derive(Debug, Clone)]
pub struct GatewaySupervisor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    launch: GatewayLaunch,
    gateway_addr: SocketAddr,
    restart: RestartPolicy,
    readiness: ReadinessPolicy,
    logs: Arc<LogRecorder>,
    state: AtomicU8,
    pid: AtomicU32,
    spawns: AtomicU64,
}

impl GatewaySupervisor {
    pub fn new(
        launch: GatewayLaunch,
        gateway_addr: SocketAddr,
        restart: RestartPolicy,
        readiness: ReadinessPolicy,
        logs: Arc<LogRecorder>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                launch,
                gateway_addr,
                restart,
                readiness,
                logs,
                state: AtomicU8::new(SupervisorState::NotStarted.as_u8()),
                pid: AtomicU32::new(0),
                spawns: AtomicU64::new(0),
            }),
        }
    }

    pub fn gateway_addr(&self) -> SocketAddr {
        self.inner.gateway_addr
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn status(&self) -> SupervisorStatus {
        let pid = self.inner.pid.load(Ordering::SeqCst);
        SupervisorStatus {
            state: self.state(),
            pid: (pid != 0).then_some(pid),
            spawns: self.inner.spawns.load(Ordering::SeqCst),
            config_present: self
                .inner
                .launch
                .config_blob
                .as_deref()
                .is_some_and(|blob| !blob.is_empty()),
        }
    }

    /// Fires the one-time gate. Returns `true` only for the call that
    /// launched the restart loop.
    pub fn ensure_started(&self) -> bool {
        let fired = self
            .inner
            .state
            .compare_exchange(
                SupervisorState::NotStarted.as_u8(),
                SupervisorState::Starting.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if fired {
            self.inner
                .logs
                .system("start-gateway: starting gateway after restore");
            tracing::info!(program = ?self.inner.launch.program, "launching gateway restart loop");
            tokio::spawn(run_restart_loop(self.inner.clone()));
        }
        fired
    }

    /// Polls the gateway port until it accepts or the ceiling elapses, then
    /// records the outcome.
    ///
    /// Polling and recording run on their own task, so dropping this future
    /// (a caller disconnecting) neither cuts the wait short nor loses its
    /// result.
    pub async fn wait_until_ready(&self) -> Readiness {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.await_readiness().await })
            .await
            .unwrap_or(Readiness::TimedOut)
    }

    pub async fn start(&self) -> Readiness {
        self.ensure_started();
        self.wait_until_ready().await
    }

    pub async fn is_accepting(&self, dial_timeout: Duration) -> bool {
        port_accepting(self.inner.gateway_addr, dial_timeout).await
    }
}

pub async fn port_accepting(addr: SocketAddr, dial_timeout: Duration) -> bool {
    matches!(timeout(dial_timeout, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

pub async fn wait_for_port(addr: SocketAddr, policy: ReadinessPolicy) -> bool {
    let deadline = Instant::now() + policy.ceiling;
    while Instant::now() < deadline {
        if port_accepting(addr, policy.dial_timeout).await {
            return true;
        }
        sleep(policy.poll_interval).await;
    }
    false
}

async fn run_restart_loop(inner: Arc<Inner>) {
    loop {
        inner.write_config();
        let delay = match inner.run_incarnation().await {
            Incarnation::Exited => inner.restart.exit_delay,
            Incarnation::FailedToStart => inner.restart.failure_delay,
        };
        inner
            .state
            .store(SupervisorState::Starting.as_u8(), Ordering::SeqCst);
        sleep(delay).await;
    }
}

enum Incarnation {
    Exited,
    FailedToStart,
}

impl Inner {
    async fn await_readiness(&self) -> Readiness {
        if wait_for_port(self.gateway_addr, self.readiness).await {
            self.logs.system("start-gateway: gateway ready");
            Readiness::Ready
        } else {
            self.logs.system(format!(
                "start-gateway: timeout waiting for gateway port {}",
                self.gateway_addr.port()
            ));
            Readiness::TimedOut
        }
    }

    fn write_config(&self) {
        let Some(blob) = self.launch.config_blob.as_deref().filter(|blob| !blob.is_empty()) else {
            return;
        };
        let bytes = normalize_gateway_config(blob.as_bytes());
        let path = &self.launch.config_path;
        match write_private(path, &bytes) {
            Ok(()) => {
                self.logs
                    .system(format!("wrote config.json ({} bytes)", bytes.len()));
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to write gateway config");
                self.logs
                    .system(format!("failed to write {}: {err}", path.display()));
            }
        }
    }

    /// Runs one gateway process to completion.
    async fn run_incarnation(&self) -> Incarnation {
        let mut command = Command::new(&self.launch.program);
        command
            .args(&self.launch.args)
            .env("HOME", &self.launch.home_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(program = ?self.launch.program, error = %err, "failed to spawn gateway");
                self.logs.system(format!("failed to start gateway: {err}"));
                return Incarnation::FailedToStart;
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            self.logs.system("gateway pipe error: stdout/stderr not captured");
            let _ = child.kill().await;
            return Incarnation::FailedToStart;
        };

        let pid = child.id().unwrap_or(0);
        self.pid.store(pid, Ordering::SeqCst);
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.state
            .store(SupervisorState::Running.as_u8(), Ordering::SeqCst);
        self.logs.system(format!("gateway started (pid={pid})"));
        tracing::info!(pid, "gateway started");

        tokio::spawn(drain_lines(LogStream::Stdout, stdout, self.logs.clone()));
        tokio::spawn(drain_lines(LogStream::Stderr, stderr, self.logs.clone()));

        match child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!(pid, "gateway exited");
                self.logs.system("gateway exited");
            }
            Ok(status) => {
                tracing::warn!(pid, code = status.code(), "gateway exited with error");
                self.logs
                    .system(format!("gateway exited with error: {status}"));
            }
            Err(err) => {
                tracing::warn!(pid, error = %err, "failed to wait for gateway");
                self.logs
                    .system(format!("gateway exited with error: {err}"));
            }
        }
        self.pid.store(0, Ordering::SeqCst);
        Incarnation::Exited
    }
}

/// Copies every line of `reader` into the recorder until EOF.
///
/// At most [`MAX_LINE_BYTES`] of a line are buffered; the rest of an
/// overlong line is discarded and reported as a system line. A read error is
/// recorded as a system line and ends the drain; it is never propagated.
async fn drain_lines<R>(stream: LogStream, reader: R, logs: Arc<LogRecorder>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut dropped = 0usize;
    loop {
        let chunk = match reader.fill_buf().await {
            Ok(chunk) => chunk,
            Err(err) => {
                logs.system(format!("{} scanner error: {err}", stream.as_str()));
                break;
            }
        };
        if chunk.is_empty() {
            if !line.is_empty() || dropped > 0 {
                flush_line(stream, &mut line, &mut dropped, &logs);
            }
            break;
        }

        let newline = chunk.iter().position(|byte| *byte == b'\n');
        let segment = &chunk[..newline.unwrap_or(chunk.len())];
        let take = segment.len().min(MAX_LINE_BYTES - line.len());
        line.extend_from_slice(&segment[..take]);
        dropped += segment.len() - take;
        let consumed = newline.map_or(chunk.len(), |pos| pos + 1);
        reader.consume(consumed);

        if newline.is_some() {
            flush_line(stream, &mut line, &mut dropped, &logs);
        }
    }
}

fn flush_line(stream: LogStream, line: &mut Vec<u8>, dropped: &mut usize, logs: &LogRecorder) {
    while line.last() == Some(&b'\r') {
        line.pop();
    }
    logs.append(stream, String::from_utf8_lossy(line).into_owned());
    if *dropped > 0 {
        logs.system(format!(
            "{} line truncated ({} bytes over {MAX_LINE_BYTES})",
            stream.as_str(),
            *dropped
        ));
    }
    line.clear();
    *dropped = 0;
}
