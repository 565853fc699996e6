//! multicosim: managed co-simulation of a simulator and a controller.
//!
//! The host runs an [`Executor`] that starts both processes, sends the
//! controller one typed config, waits for one typed result, and tears
//! everything down. Controller executables wrap their work with
//! [`wrap_as_service`].

pub mod bridge;
pub mod error;
pub mod executor;
pub mod logging;
pub mod process;
pub mod service;
pub mod simulator;
mod version;

pub use bridge::protocol::{Envelope, MessageKind, Reply};
pub use bridge::transport::{DEFAULT_PORT, RetryPolicy, free_port};
pub use error::{SessionError, Stage};
pub use executor::{Executor, ExecutorConfig, Session, wrap_as_executor};
pub use logging::init_tracing;
pub use process::{
    CommandLauncher, DockerLauncher, LaunchError, LaunchSpec, Launcher, Process, ProcessHandle,
    ProcessState, Readiness, Role,
};
pub use service::{ControllerService, ServiceError, ServiceState, wrap_as_service};
pub use simulator::{
    DartSolver, OdeSolver, PhysicsBackend, SimulatorConfig, SimulatorState, SimulatorSupervisor,
    World,
};
pub use version::{MULTICOSIM_VERSION, PROTOCOL_VERSION, VersionInfo};
