//! Container launcher backed by the docker CLI.
//!
//! Containers run detached with each requested port published on an
//! ephemeral loopback port; `docker port` resolves the mapping. Output is
//! followed with `docker logs -f`.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::logs::{LineSink, LogTail, Stream, pump};
use super::{LaunchError, LaunchSpec, Launcher, Process, Readiness, probe_port};

/// Exit codes that count as a clean shutdown (plain exit, SIGKILL, SIGTERM).
const CLEAN_EXIT_CODES: [i32; 3] = [0, 137, 143];

/// Append `:latest` when the reference carries neither tag nor digest.
pub fn normalize_image(reference: &str) -> String {
    let name = reference.rsplit('/').next().unwrap_or(reference);
    if name.contains(':') || reference.contains('@') {
        reference.to_string()
    } else {
        format!("{reference}:latest")
    }
}

#[derive(Debug, Clone)]
pub struct DockerLauncher {
    binary: String,
}

impl Default for DockerLauncher {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl DockerLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

async fn run_cli(binary: &str, args: &[String]) -> Result<String, LaunchError> {
    let output = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| LaunchError::Spawn {
            program: binary.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(LaunchError::Runtime(format!(
            "{} {} failed: {}",
            binary,
            args.first().map(String::as_str).unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--detach".to_string()];
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(format!("127.0.0.1::{port}/tcp"));
    }
    args.push(normalize_image(&spec.image));
    args.extend(spec.args.iter().cloned());
    args
}

/// First usable address in `docker port` output.
fn parse_port_output(output: &str) -> Option<SocketAddr> {
    output
        .lines()
        .filter_map(|line| line.trim().parse::<SocketAddr>().ok())
        .map(|mut addr| {
            if addr.ip().is_unspecified() {
                addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            addr
        })
        .next()
}

/// Parse `{{.State.Running}} {{.State.ExitCode}}`; `None` while running.
fn parse_state(output: &str) -> Option<i32> {
    let mut parts = output.split_whitespace();
    let running = parts.next()?;
    let code = parts.next()?.parse().ok()?;
    (running == "false").then_some(code)
}

#[async_trait]
impl Launcher for DockerLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn Process>, LaunchError> {
        let args = run_args(spec);
        tracing::debug!(role = %spec.role, ?args, "Starting container");
        let id = run_cli(&self.binary, &args).await?;
        if id.is_empty() {
            return Err(LaunchError::Runtime(format!(
                "{} run returned no container id",
                self.binary
            )));
        }

        let short_id: String = id.chars().take(12).collect();
        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let tail = LogTail::new(spec.log_tail);

        let display_id = format!("{}:{}", spec.role, short_id);
        let sink = LineSink {
            role: spec.role,
            process_id: display_id.clone(),
            tail: tail.clone(),
            ready: match &spec.readiness {
                Readiness::LogLine(pattern) => Some((pattern.clone(), ready_tx)),
                _ => None,
            },
        };
        let mut container = ContainerProcess {
            binary: self.binary.clone(),
            id,
            display_id,
            endpoints: HashMap::new(),
            readiness: spec.readiness.clone(),
            ready_rx,
            tail,
            follower: None,
            remove: spec.remove,
            exit: None,
        };

        match container.attach(spec, sink).await {
            Ok(()) => Ok(Box::new(container)),
            Err(e) => {
                container.discard().await;
                Err(e)
            }
        }
    }
}

struct ContainerProcess {
    binary: String,
    id: String,
    display_id: String,
    endpoints: HashMap<u16, SocketAddr>,
    readiness: Readiness,
    ready_rx: watch::Receiver<bool>,
    tail: LogTail,
    /// `docker logs -f`; exits when the container stops.
    follower: Option<Child>,
    remove: bool,
    exit: Option<i32>,
}

impl ContainerProcess {
    /// Resolve published ports and start following output.
    async fn attach(&mut self, spec: &LaunchSpec, sink: LineSink) -> Result<(), LaunchError> {
        for &port in &spec.ports {
            let output = run_cli(
                &self.binary,
                &["port".to_string(), self.id.clone(), format!("{port}/tcp")],
            )
            .await?;
            let addr = parse_port_output(&output).ok_or(LaunchError::PortNotPublished(port))?;
            tracing::debug!(process_id = %self.display_id, port, %addr, "Resolved published port");
            self.endpoints.insert(port, addr);
        }

        let mut follower = Command::new(&self.binary)
            .args(["logs", "--follow", self.id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.binary.clone(),
                source,
            })?;
        if let Some(stdout) = follower.stdout.take() {
            pump(stdout, Stream::Stdout, sink.clone());
        }
        if let Some(stderr) = follower.stderr.take() {
            pump(stderr, Stream::Stderr, sink);
        }
        self.follower = Some(follower);
        Ok(())
    }

    fn cli_args(&self, args: &[&str]) -> Vec<String> {
        args.iter()
            .map(|a| a.to_string())
            .chain(std::iter::once(self.id.clone()))
            .collect()
    }

    /// Force-remove a container that never became usable.
    async fn discard(&mut self) {
        self.stop_following();
        if let Err(e) = run_cli(&self.binary, &self.cli_args(&["rm", "--force"])).await {
            tracing::warn!(process_id = %self.display_id, error = %e, "Failed to remove container");
        }
    }

    fn stop_following(&mut self) {
        if let Some(follower) = self.follower.as_mut() {
            let _ = follower.start_kill();
        }
    }

    /// Block until the container stops and record its exit code.
    async fn wait_exit(&mut self) -> Option<i32> {
        if self.exit.is_some() {
            return self.exit;
        }
        match run_cli(&self.binary, &self.cli_args(&["wait"])).await {
            Ok(output) => {
                self.exit = output.trim().parse().ok();
                self.exit
            }
            Err(e) => {
                tracing::warn!(process_id = %self.display_id, error = %e, "Failed to wait for container");
                None
            }
        }
    }

    async fn exited_early(&mut self) -> LaunchError {
        let status = self.wait_exit().await;
        LaunchError::ExitedEarly {
            status,
            logs: self.tail.snapshot(),
        }
    }

    /// Resolves when the log follower ends, i.e. the container stopped.
    async fn follower_done(&mut self) {
        match self.follower.as_mut() {
            Some(follower) => {
                let _ = follower.wait().await;
            }
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Process for ContainerProcess {
    fn id(&self) -> &str {
        &self.display_id
    }

    fn endpoint(&self, port: u16) -> Option<SocketAddr> {
        self.endpoints.get(&port).copied()
    }

    /// Port probes hit docker's proxy, which accepts before the container
    /// listens; prefer [`Readiness::LogLine`] for containers.
    async fn ready(&mut self) -> Result<(), LaunchError> {
        match self.readiness.clone() {
            Readiness::Immediate => match self.exit_status().await {
                Some(_) => Err(self.exited_early().await),
                None => Ok(()),
            },
            Readiness::LogLine(_) => {
                let mut ready_rx = self.ready_rx.clone();
                let seen = async move { ready_rx.wait_for(|ready| *ready).await.is_ok() };
                tokio::select! {
                    biased;
                    seen = seen => {
                        if seen {
                            return Ok(());
                        }
                        Err(self.exited_early().await)
                    }
                    _ = self.follower_done() => {
                        let seen = *self.ready_rx.borrow();
                        if seen {
                            return Ok(());
                        }
                        Err(self.exited_early().await)
                    }
                }
            }
            Readiness::Port(port) => {
                let addr = self
                    .endpoint(port)
                    .ok_or(LaunchError::PortNotPublished(port))?;
                tokio::select! {
                    _ = probe_port(addr) => Ok(()),
                    _ = self.follower_done() => Err(self.exited_early().await),
                }
            }
        }
    }

    async fn exit_status(&mut self) -> Option<i32> {
        if self.exit.is_some() {
            return self.exit;
        }
        let args = self.cli_args(&["inspect", "--format", "{{.State.Running}} {{.State.ExitCode}}"]);
        match run_cli(&self.binary, &args).await {
            Ok(output) => {
                self.exit = parse_state(&output);
                self.exit
            }
            Err(e) => {
                tracing::debug!(process_id = %self.display_id, error = %e, "Failed to inspect container");
                None
            }
        }
    }

    async fn stop(&mut self, grace: Duration) -> Result<Option<i32>, LaunchError> {
        if self.exit_status().await.is_none() {
            let secs = grace.as_secs_f64().ceil() as u64;
            run_cli(&self.binary, &self.cli_args(&["stop", "--time", secs.to_string().as_str()]))
                .await
                .map_err(|e| LaunchError::Stop(format!("{}: {}", self.display_id, e)))?;
        }
        let code = self.wait_exit().await;
        self.stop_following();

        match code {
            Some(code) if !CLEAN_EXIT_CODES.contains(&code) => {
                tracing::warn!(
                    process_id = %self.display_id,
                    code,
                    "Container exited abnormally, check its logs"
                );
            }
            _ => {}
        }

        if self.remove
            && let Err(e) = run_cli(&self.binary, &self.cli_args(&["rm", "--force"])).await
        {
            tracing::warn!(process_id = %self.display_id, error = %e, "Failed to remove container");
        }
        Ok(code)
    }

    fn start_kill(&mut self) {
        self.stop_following();
        let verb: &[&str] = if self.remove { &["rm", "--force"] } else { &["kill"] };
        let args = self.cli_args(verb);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let binary = self.binary.clone();
                let display_id = self.display_id.clone();
                runtime.spawn(async move {
                    if let Err(e) = run_cli(&binary, &args).await {
                        tracing::warn!(process_id = %display_id, error = %e, "Failed to kill container");
                    }
                });
            }
            Err(_) => {
                let spawned = std::process::Command::new(&self.binary)
                    .args(&args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn();
                if let Err(e) = spawned {
                    tracing::warn!(process_id = %self.display_id, error = %e, "Failed to kill container");
                }
            }
        }
    }

    fn logs(&self) -> Vec<String> {
        self.tail.snapshot()
    }
}
