//! Simulator supervisor - owns the simulator process lifecycle.
//!
//! The simulator is started from a [`SimulatorConfig`], awaited until ready,
//! and then described to the controller side as a [`World`].
//!
//! States: `Created → Starting → Ready → Running → Stopped`, with `Failed`
//! reachable from `Starting` and `Running`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::process::{
    DEFAULT_TAIL_LINES, LaunchError, LaunchSpec, Launcher, ProcessHandle, ProcessState, Readiness,
    Role,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OdeSolver {
    /// Iterative projected Gauss-Seidel; accuracy scales with iterations.
    #[default]
    Quick,
    /// Direct Dantzig method.
    World,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DartSolver {
    #[default]
    Dantzig,
    Pgs,
}

/// Physics engine used for the simulation dynamics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum PhysicsBackend {
    Ode { solver: OdeSolver, iterations: u32 },
    Dart { solver: DartSolver },
    Bullet { iterations: u32 },
    Simbody,
}

impl Default for PhysicsBackend {
    fn default() -> Self {
        Self::Ode {
            solver: OdeSolver::Quick,
            iterations: 50,
        }
    }
}

impl PhysicsBackend {
    pub fn bullet() -> Self {
        Self::Bullet { iterations: 50 }
    }

    pub fn dart() -> Self {
        Self::Dart {
            solver: DartSolver::default(),
        }
    }

    /// Simulator arguments selecting this backend.
    pub fn args(&self) -> Vec<String> {
        match self {
            Self::Ode { solver, iterations } => {
                let solver = match solver {
                    OdeSolver::Quick => "quick",
                    OdeSolver::World => "world",
                };
                vec![
                    "ode".to_string(),
                    "--solver".to_string(),
                    solver.to_string(),
                    "--iterations".to_string(),
                    iterations.to_string(),
                ]
            }
            Self::Dart { solver } => {
                let solver = match solver {
                    DartSolver::Dantzig => "dantzig",
                    DartSolver::Pgs => "pgs",
                };
                vec!["dart".to_string(), "--solver".to_string(), solver.to_string()]
            }
            Self::Bullet { iterations } => vec![
                "bullet".to_string(),
                "--iterations".to_string(),
                iterations.to_string(),
            ],
            Self::Simbody => vec!["simbody".to_string()],
        }
    }
}

/// Parameters for one simulator run.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Program run inside the simulator image; `None` uses the image entrypoint.
    pub command: Option<String>,
    pub step_size: f64,
    pub backend: PhysicsBackend,
    /// World template the generated world is built from.
    pub base_world: PathBuf,
    /// Path the simulator writes the generated world to.
    pub world: PathBuf,
    pub readiness: Readiness,
    /// Port the controller uses to reach the simulator, if any.
    pub port: Option<u16>,
    pub env: Vec<(String, String)>,
    pub remove: bool,
    pub log_tail: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            command: Some("gazebo".to_string()),
            step_size: 0.001,
            backend: PhysicsBackend::default(),
            base_world: PathBuf::from("resources/world/default.sdf"),
            world: PathBuf::from("/tmp/generated.sdf"),
            readiness: Readiness::Immediate,
            port: None,
            env: Vec::new(),
            remove: true,
            log_tail: DEFAULT_TAIL_LINES,
        }
    }
}

impl SimulatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: Option<String>) -> Self {
        self.command = command;
        self
    }

    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_backend(mut self, backend: PhysicsBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_base_world(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_world = path.into();
        self
    }

    pub fn with_world(mut self, path: impl Into<PathBuf>) -> Self {
        self.world = path.into();
        self
    }

    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_remove(mut self, remove: bool) -> Self {
        self.remove = remove;
        self
    }

    /// Simulator argv: `[command] --base <template> --world <world> --step-size <s> <backend>`.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(command) = &self.command {
            argv.push(command.clone());
        }
        argv.extend([
            "--base".to_string(),
            self.base_world.display().to_string(),
            "--world".to_string(),
            self.world.display().to_string(),
            "--step-size".to_string(),
            self.step_size.to_string(),
        ]);
        argv.extend(self.backend.args());
        argv
    }

    /// World name the controller addresses: the generated world's file stem.
    pub fn world_name(&self) -> String {
        world_stem(&self.world)
    }

    pub fn launch_spec(&self, image: &str) -> LaunchSpec {
        let mut spec = LaunchSpec::new(Role::Simulator, image)
            .with_args(self.argv())
            .with_readiness(self.readiness.clone())
            .with_log_tail(self.log_tail)
            .with_remove(self.remove);
        if let Some(port) = self.port {
            spec = spec.with_port(port);
        }
        for (key, value) in &self.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        spec
    }
}

fn world_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// What the controller side needs to know about a running simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct World {
    pub name: String,
    /// Host address of the simulator's published port, if it has one.
    pub address: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatorState {
    Created,
    Starting,
    Ready,
    Running,
    Stopped,
    Failed(String),
}

impl SimulatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed(_) => "failed",
        }
    }
}

/// Owns the simulator process for one session.
pub struct SimulatorSupervisor {
    image: String,
    config: SimulatorConfig,
    state: SimulatorState,
    handle: Option<ProcessHandle>,
    world: Option<World>,
}

impl SimulatorSupervisor {
    pub fn new(image: impl Into<String>, config: SimulatorConfig) -> Self {
        Self {
            image: image.into(),
            config,
            state: SimulatorState::Created,
            handle: None,
            world: None,
        }
    }

    pub fn state(&self) -> &SimulatorState {
        &self.state
    }

    pub fn world(&self) -> Option<&World> {
        self.world.as_ref()
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.handle.as_ref()
    }

    /// Launch the simulator and wait for it to become ready.
    ///
    /// On failure the process (if any) is kept so [`stop`](Self::stop) can
    /// reap it.
    pub async fn start(
        &mut self,
        launcher: &dyn Launcher,
        ready_timeout: Duration,
    ) -> Result<World, LaunchError> {
        self.state = SimulatorState::Starting;
        tracing::info!(
            image = %self.image,
            world = %self.config.world.display(),
            step_size = self.config.step_size,
            backend = ?self.config.backend,
            "Starting simulator"
        );

        let spec = self.config.launch_spec(&self.image);
        let handle = match ProcessHandle::launch(launcher, &spec).await {
            Ok(handle) => self.handle.insert(handle),
            Err(e) => {
                self.state = SimulatorState::Failed(e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = handle.await_ready(ready_timeout).await {
            self.state = SimulatorState::Failed(e.to_string());
            return Err(e);
        }

        let address = match self.config.port {
            Some(port) => match handle.endpoint(port) {
                Some(addr) => Some(addr),
                None => {
                    let e = LaunchError::PortNotPublished(port);
                    self.state = SimulatorState::Failed(e.to_string());
                    return Err(e);
                }
            },
            None => None,
        };
        let world = World {
            name: self.config.world_name(),
            address,
        };
        tracing::info!(world = %world.name, address = ?world.address, "Simulator ready");

        self.state = SimulatorState::Ready;
        self.world = Some(world.clone());
        Ok(world)
    }

    /// Record that the session is now using the simulator.
    pub fn mark_running(&mut self) {
        if self.state == SimulatorState::Ready {
            self.state = SimulatorState::Running;
            if let Some(handle) = self.handle.as_mut() {
                handle.mark_running();
            }
        }
    }

    /// Returns false and moves to `Failed` if a running simulator has exited.
    pub async fn check_alive(&mut self) -> bool {
        if self.state != SimulatorState::Running {
            return !matches!(self.state, SimulatorState::Failed(_) | SimulatorState::Stopped);
        }
        let Some(handle) = self.handle.as_mut() else {
            return false;
        };
        match handle.exit_status().await {
            Some(code) => {
                tracing::warn!(code, "Simulator exited while running");
                self.state = SimulatorState::Failed(format!("exited with status {code}"));
                false
            }
            None => true,
        }
    }

    /// Exit code recorded for the simulator process, if it has exited.
    pub fn exit_code(&self) -> Option<i32> {
        match self.handle.as_ref().map(ProcessHandle::state) {
            Some(ProcessState::Exited(code)) => Some(*code),
            _ => None,
        }
    }

    /// Recent simulator output.
    pub fn logs(&self) -> Vec<String> {
        self.handle.as_ref().map(ProcessHandle::logs).unwrap_or_default()
    }

    /// Stop the simulator within `grace`, forcing termination afterwards.
    ///
    /// Idempotent. A `Failed` supervisor stays `Failed` once reaped.
    pub async fn stop(&mut self, grace: Duration) -> Result<(), LaunchError> {
        let result = match self.handle.as_mut() {
            Some(handle) => handle.stop(grace).await,
            None => Ok(()),
        };
        if !matches!(self.state, SimulatorState::Failed(_)) {
            self.state = SimulatorState::Stopped;
        }
        result
    }
}
