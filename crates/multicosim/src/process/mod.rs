//! Isolated execution environments for the simulator and controller.
//!
//! A [`Launcher`] turns a [`LaunchSpec`] into a running [`Process`]; the
//! session owns it through a [`ProcessHandle`], which tracks state, gives a
//! uniform readiness wait, and guarantees the process is stopped or killed.
//!
//! Two launchers ship here:
//! - [`CommandLauncher`]: local subprocesses
//! - [`DockerLauncher`]: containers driven through the docker CLI

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

mod command;
mod docker;
pub(crate) mod logs;

pub use command::CommandLauncher;
pub use docker::{DockerLauncher, normalize_image};
pub use logs::{DEFAULT_TAIL_LINES, LogTail};

use logs::fmt_tail;

/// Interval between readiness port probes.
const PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// Which side of the co-simulation a process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Simulator,
    Controller,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulator => "simulator",
            Self::Controller => "controller",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a launched process signals that it is ready for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready as soon as it is running.
    Immediate,
    /// Ready once a line of output contains this substring.
    LogLine(String),
    /// Ready once this port (inside the environment) accepts TCP connections.
    Port(u16),
}

/// Everything a launcher needs to start one process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: Role,
    /// Container image for [`DockerLauncher`], program path for [`CommandLauncher`].
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Ports inside the environment that must be reachable from the host.
    pub ports: Vec<u16>,
    pub readiness: Readiness,
    pub log_tail: usize,
    /// Remove the environment (container) after it stops.
    pub remove: bool,
}

impl LaunchSpec {
    pub fn new(role: Role, image: impl Into<String>) -> Self {
        Self {
            role,
            image: image.into(),
            args: Vec::new(),
            env: Vec::new(),
            ports: Vec::new(),
            readiness: Readiness::Immediate,
            log_tail: DEFAULT_TAIL_LINES,
            remove: true,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        if let Readiness::Port(port) = readiness {
            self = self.with_port(port);
        }
        self.readiness = readiness;
        self
    }

    pub fn with_log_tail(mut self, lines: usize) -> Self {
        self.log_tail = lines;
        self
    }

    pub fn with_remove(mut self, remove: bool) -> Self {
        self.remove = remove;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The execution runtime refused or failed the request.
    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("not ready after {timeout:?}{}", fmt_tail(.logs))]
    ReadyTimeout {
        timeout: Duration,
        logs: Vec<String>,
    },

    #[error("exited with status {} before becoming ready{}", fmt_status(.status), fmt_tail(.logs))]
    ExitedEarly {
        status: Option<i32>,
        logs: Vec<String>,
    },

    #[error("port {0} is not published")]
    PortNotPublished(u16),

    #[error("failed to stop: {0}")]
    Stop(String),
}

fn fmt_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "unknown".to_string(),
    }
}

/// A process started by a [`Launcher`].
#[async_trait]
pub trait Process: Send {
    fn id(&self) -> &str;

    /// Host address that reaches `port` inside the environment.
    fn endpoint(&self, port: u16) -> Option<SocketAddr>;

    /// Resolve once the readiness probe passes.
    ///
    /// Returns [`LaunchError::ExitedEarly`] if the process dies first. Callers
    /// bound the wait; implementations may wait forever.
    async fn ready(&mut self) -> Result<(), LaunchError>;

    /// Exit code if the process has exited.
    async fn exit_status(&mut self) -> Option<i32>;

    /// Terminate gracefully, forcing after `grace`. Returns the exit code.
    async fn stop(&mut self, grace: Duration) -> Result<Option<i32>, LaunchError>;

    /// Begin a forced kill without waiting. Used from `Drop`.
    fn start_kill(&mut self);

    fn logs(&self) -> Vec<String>;
}

/// Extension point for execution environments.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn Process>, LaunchError>;
}

/// Wait until `addr` accepts a TCP connection.
pub(crate) async fn probe_port(addr: SocketAddr) {
    loop {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

/// Lifecycle state of a managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Ready,
    Running,
    Exited(i32),
    Failed(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited(_) | Self::Failed(_))
    }
}

/// Exclusive owner of one launched process.
///
/// `stop` is idempotent. A handle dropped without being stopped kills its
/// process, so a cancelled session leaves nothing behind.
pub struct ProcessHandle {
    role: Role,
    process: Box<dyn Process>,
    state: ProcessState,
    stopped: bool,
}

impl ProcessHandle {
    pub fn new(role: Role, process: Box<dyn Process>) -> Self {
        tracing::debug!(%role, process_id = %process.id(), "Process started");
        Self {
            role,
            process,
            state: ProcessState::Starting,
            stopped: false,
        }
    }

    pub async fn launch(launcher: &dyn Launcher, spec: &LaunchSpec) -> Result<Self, LaunchError> {
        tracing::info!(role = %spec.role, image = %spec.image, "Launching process");
        let process = launcher.launch(spec).await?;
        Ok(Self::new(spec.role, process))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> &str {
        self.process.id()
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn endpoint(&self, port: u16) -> Option<SocketAddr> {
        self.process.endpoint(port)
    }

    pub fn logs(&self) -> Vec<String> {
        self.process.logs()
    }

    /// Block until the readiness probe passes or `timeout` expires.
    pub async fn await_ready(&mut self, timeout: Duration) -> Result<(), LaunchError> {
        let outcome = match tokio::time::timeout(timeout, self.process.ready()).await {
            Ok(result) => result,
            Err(_) => Err(LaunchError::ReadyTimeout {
                timeout,
                logs: self.process.logs(),
            }),
        };

        match outcome {
            Ok(()) => {
                tracing::info!(role = %self.role, process_id = %self.id(), "Process ready");
                self.state = ProcessState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(role = %self.role, process_id = %self.id(), error = %e, "Process failed to become ready");
                self.state = match &e {
                    LaunchError::ExitedEarly {
                        status: Some(code), ..
                    } => ProcessState::Exited(*code),
                    other => ProcessState::Failed(other.to_string()),
                };
                Err(e)
            }
        }
    }

    pub fn mark_running(&mut self) {
        if self.state == ProcessState::Ready {
            self.state = ProcessState::Running;
        }
    }

    /// Exit code if the process has exited; records the exit in the state.
    pub async fn exit_status(&mut self) -> Option<i32> {
        if let ProcessState::Exited(code) = self.state {
            return Some(code);
        }
        let status = self.process.exit_status().await;
        if let Some(code) = status
            && !self.state.is_terminal()
        {
            self.state = ProcessState::Exited(code);
        }
        status
    }

    /// Stop the process. Safe to call repeatedly and on exited processes.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        tracing::info!(role = %self.role, process_id = %self.id(), ?grace, "Stopping process");
        match self.process.stop(grace).await {
            Ok(code) => {
                if !self.state.is_terminal() || code.is_some() {
                    self.state = ProcessState::Exited(code.unwrap_or(-1));
                }
                tracing::debug!(role = %self.role, process_id = %self.id(), ?code, "Process stopped");
                Ok(())
            }
            Err(e) => {
                self.process.start_kill();
                self.state = ProcessState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.stopped {
            tracing::warn!(role = %self.role, process_id = %self.process.id(), "Process handle dropped without stop, killing");
            self.process.start_kill();
        }
    }
}
