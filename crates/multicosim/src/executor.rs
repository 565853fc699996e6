//! Executor - host-side orchestration of one co-simulation session.
//!
//! Flow:
//! 1. Start the simulator, wait for ready, learn the [`World`]
//! 2. Start the controller, wait for ready
//! 3. Build the controller config from the world and caller args
//! 4. Connect, send `start`, wait (bounded) for the terminal reply
//! 5. Stop controller, then simulator, whatever the outcome

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::bridge::protocol::{Envelope, Reply};
use crate::bridge::transport::{self, ChannelError, Connection, DEFAULT_PORT, RetryPolicy};
use crate::error::{SessionError, Stage};
use crate::process::{
    DEFAULT_TAIL_LINES, DockerLauncher, LaunchError, LaunchSpec, Launcher, ProcessHandle,
    Readiness, Role,
};
use crate::service::{PORT_ENV, READY_MARKER};
use crate::simulator::{SimulatorConfig, SimulatorSupervisor, World};
use crate::version::VersionInfo;

/// How long a reply may still arrive after the controller process exits.
const EXIT_DRAIN: Duration = Duration::from_secs(2);

/// Identity of one `run()` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub version: VersionInfo,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            version: VersionInfo::new(),
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Timeouts and launch settings shared by every session of an executor.
#[derive(Clone)]
pub struct ExecutorConfig {
    pub simulator_ready_timeout: Duration,
    pub controller_ready_timeout: Duration,
    pub reply_timeout: Duration,
    pub stop_grace: Duration,
    /// Interval between liveness checks while waiting for the reply.
    pub liveness_interval: Duration,
    pub retry: RetryPolicy,
    pub max_frame_length: usize,
    pub controller_readiness: Readiness,
    pub controller_args: Vec<String>,
    pub controller_env: Vec<(String, String)>,
    pub remove: bool,
    pub log_tail: usize,
    pub launcher: Arc<dyn Launcher>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            simulator_ready_timeout: Duration::from_secs(60),
            controller_ready_timeout: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(600),
            stop_grace: Duration::from_secs(10),
            liveness_interval: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            controller_readiness: Readiness::LogLine(READY_MARKER.to_string()),
            controller_args: Vec::new(),
            controller_env: Vec::new(),
            remove: true,
            log_tail: DEFAULT_TAIL_LINES,
            launcher: Arc::new(DockerLauncher::new()),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_simulator_ready_timeout(mut self, timeout: Duration) -> Self {
        self.simulator_ready_timeout = timeout;
        self
    }

    pub fn with_controller_ready_timeout(mut self, timeout: Duration) -> Self {
        self.controller_ready_timeout = timeout;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Largest frame sent or accepted; must match the controller's limit.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn with_controller_readiness(mut self, readiness: Readiness) -> Self {
        self.controller_readiness = readiness;
        self
    }

    pub fn with_controller_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.controller_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_controller_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.controller_env.push((key.into(), value.into()));
        self
    }

    pub fn with_remove(mut self, remove: bool) -> Self {
        self.remove = remove;
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }
}

/// A config-building function bound to a simulator and controller image.
pub struct Executor<G, A, C, R, E> {
    g: G,
    simulator_image: String,
    controller_image: String,
    port: u16,
    config: ExecutorConfig,
    _types: PhantomData<fn(A) -> Result<(C, R), E>>,
}

/// Wrap `g` into an executor that runs full sessions.
///
/// `port` is the controller's listening port inside its environment; `0`
/// means the default port.
pub fn wrap_as_executor<G, A, C, R, E>(
    g: G,
    simulator_image: impl Into<String>,
    controller_image: impl Into<String>,
    port: u16,
) -> Executor<G, A, C, R, E>
where
    G: Fn(&World, A) -> Result<C, E>,
    C: Serialize,
    R: DeserializeOwned,
    E: Display,
{
    Executor {
        g,
        simulator_image: simulator_image.into(),
        controller_image: controller_image.into(),
        port: if port == 0 { DEFAULT_PORT } else { port },
        config: ExecutorConfig::default(),
        _types: PhantomData,
    }
}

impl<G, A, C, R, E> Executor<G, A, C, R, E>
where
    G: Fn(&World, A) -> Result<C, E>,
    C: Serialize,
    R: DeserializeOwned,
    E: Display,
{
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn controller_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(Role::Controller, self.controller_image.clone())
            .with_args(self.config.controller_args.iter().cloned())
            .with_env(PORT_ENV, self.port.to_string())
            .with_port(self.port)
            .with_readiness(self.config.controller_readiness.clone())
            .with_log_tail(self.config.log_tail)
            .with_remove(self.config.remove);
        for (key, value) in &self.config.controller_env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        spec
    }

    /// Run one session to completion.
    ///
    /// Every process started here is stopped before this returns, on success
    /// and on failure. Dropping the future kills whatever is still running.
    pub async fn run(&self, simulator_config: SimulatorConfig, args: A) -> Result<R, SessionError> {
        let session = Session::new();
        let span = tracing::info_span!("session", session_id = %session.id);
        self.run_session(session, simulator_config, args)
            .instrument(span)
            .await
    }

    async fn run_session(
        &self,
        session: Session,
        simulator_config: SimulatorConfig,
        args: A,
    ) -> Result<R, SessionError> {
        tracing::info!(
            simulator = %self.simulator_image,
            controller = %self.controller_image,
            started_at = %session.started_at,
            multicosim = session.version.multicosim,
            protocol = session.version.protocol,
            "Session starting"
        );

        let mut simulator = SimulatorSupervisor::new(self.simulator_image.clone(), simulator_config);
        let mut controller: Option<ProcessHandle> = None;

        let result = self.drive(&mut simulator, &mut controller, args).await;

        // Reverse start order; cleanup failures never replace the outcome.
        if let Some(handle) = controller.as_mut()
            && let Err(e) = handle.stop(self.config.stop_grace).await
        {
            tracing::warn!(role = %Role::Controller, error = %e, "Cleanup failed");
        }
        if let Err(e) = simulator.stop(self.config.stop_grace).await {
            tracing::warn!(role = %Role::Simulator, error = %e, "Cleanup failed");
        }

        let elapsed = Utc::now() - session.started_at;
        match &result {
            Ok(_) => tracing::info!(elapsed_ms = elapsed.num_milliseconds(), "Session completed"),
            Err(e) => tracing::warn!(
                elapsed_ms = elapsed.num_milliseconds(),
                stage = %e.stage(),
                error = %e,
                "Session failed"
            ),
        }
        result
    }

    async fn drive(
        &self,
        simulator: &mut SimulatorSupervisor,
        controller: &mut Option<ProcessHandle>,
        args: A,
    ) -> Result<R, SessionError> {
        let launcher = self.config.launcher.as_ref();

        let world = simulator
            .start(launcher, self.config.simulator_ready_timeout)
            .await
            .map_err(|source| SessionError::Launch {
                role: Role::Simulator,
                source,
            })?;
        simulator.mark_running();

        let controller_launch = |source: LaunchError| SessionError::Launch {
            role: Role::Controller,
            source,
        };
        let handle = ProcessHandle::launch(launcher, &self.controller_spec())
            .await
            .map_err(controller_launch)?;
        let handle = controller.insert(handle);
        handle
            .await_ready(self.config.controller_ready_timeout)
            .await
            .map_err(controller_launch)?;
        handle.mark_running();

        let config = (self.g)(&world, args).map_err(|e| SessionError::ConfigBuild(e.to_string()))?;
        let start = Envelope::start(&config).map_err(|source| SessionError::Codec {
            stage: Stage::Encode,
            source,
        })?;

        let address = handle
            .endpoint(self.port)
            .ok_or_else(|| controller_launch(LaunchError::PortNotPublished(self.port)))?;

        tracing::debug!(%address, "Connecting to controller");
        let mut conn = transport::connect(address, &self.config.retry)
            .await
            .map_err(|source| SessionError::Transport {
                stage: Stage::Connect,
                source,
            })?;
        conn.set_max_frame_length(self.config.max_frame_length);
        conn.send(start).await.map_err(|e| match e {
            ChannelError::Codec(source) => SessionError::Codec {
                stage: Stage::Encode,
                source,
            },
            ChannelError::Transport(source) => SessionError::Transport {
                stage: Stage::Send,
                source,
            },
        })?;
        tracing::info!(world = %world.name, "Start sent, waiting for controller reply");

        let envelope = self.await_reply(&mut conn, simulator, handle).await?;

        match envelope.into_reply::<R>() {
            Ok(Reply::Result(result)) => Ok(result),
            Ok(Reply::Error(message)) => Err(SessionError::Controller(message)),
            Err(source) => Err(SessionError::Codec {
                stage: Stage::Decode,
                source,
            }),
        }
    }

    /// Wait for the terminal reply while watching both processes.
    ///
    /// A simulator exit fails the session at once. A controller exit leaves
    /// a short window for a reply already in flight.
    async fn await_reply(
        &self,
        conn: &mut Connection,
        simulator: &mut SimulatorSupervisor,
        controller: &mut ProcessHandle,
    ) -> Result<Envelope, SessionError> {
        let deadline = tokio::time::sleep(self.config.reply_timeout);
        tokio::pin!(deadline);
        let period = self.config.liveness_interval.max(Duration::from_millis(1));
        let mut liveness = tokio::time::interval(period);
        liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        liveness.tick().await;

        let receive = conn.receive();
        tokio::pin!(receive);

        loop {
            tokio::select! {
                biased;
                received = &mut receive => return self.reply_from(received),
                _ = &mut deadline => {
                    return Err(SessionError::Timeout {
                        stage: Stage::Receive,
                        after: self.config.reply_timeout,
                    });
                }
                _ = liveness.tick() => {
                    if !simulator.check_alive().await {
                        return Err(SessionError::Exited {
                            role: Role::Simulator,
                            status: simulator.exit_code().unwrap_or(-1),
                            logs: simulator.logs(),
                        });
                    }
                    if let Some(status) = controller.exit_status().await {
                        tracing::warn!(status, "Controller exited before replying");
                        return match tokio::time::timeout(EXIT_DRAIN, &mut receive).await {
                            Ok(received) => self.reply_from(received),
                            Err(_) => Err(SessionError::Exited {
                                role: Role::Controller,
                                status,
                                logs: controller.logs(),
                            }),
                        };
                    }
                }
            }
        }
    }

    fn reply_from(&self, received: Result<Envelope, ChannelError>) -> Result<Envelope, SessionError> {
        received.map_err(|e| match e {
            ChannelError::Transport(source) => SessionError::Transport {
                stage: Stage::Receive,
                source,
            },
            ChannelError::Codec(source) => SessionError::Codec {
                stage: Stage::Decode,
                source,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(world: &World, waypoints: usize) -> Result<serde_json::Value, String> {
        if waypoints == 0 {
            return Err("no waypoints".to_string());
        }
        Ok(serde_json::json!({ "world": world.name, "waypoints": waypoints }))
    }

    #[test]
    fn defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.simulator_ready_timeout, Duration::from_secs(60));
        assert_eq!(config.controller_ready_timeout, Duration::from_secs(30));
        assert_eq!(config.reply_timeout, Duration::from_secs(600));
        assert_eq!(config.stop_grace, Duration::from_secs(10));
        assert_eq!(config.retry.budget, Duration::from_secs(10));
        assert_eq!(config.liveness_interval, Duration::from_millis(500));
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert_eq!(
            config.controller_readiness,
            Readiness::LogLine(READY_MARKER.to_string())
        );
    }

    #[test]
    fn zero_port_means_default() {
        let executor: Executor<_, _, _, serde_json::Value, _> =
            wrap_as_executor(build, "gazebo", "px4", 0);
        assert_eq!(executor.port(), DEFAULT_PORT);
    }

    #[test]
    fn controller_spec_carries_port() {
        let executor: Executor<_, _, _, serde_json::Value, _> =
            wrap_as_executor(build, "gazebo", "px4-controller", 6000).with_config(
                ExecutorConfig::new()
                    .with_controller_args(["--verbose"])
                    .with_controller_env("PX4_HOME_LAT", "47.39")
                    .with_remove(false),
            );
        let spec = executor.controller_spec();
        assert_eq!(spec.role, Role::Controller);
        assert_eq!(spec.image, "px4-controller");
        assert_eq!(spec.ports, vec![6000]);
        assert_eq!(spec.args, vec!["--verbose"]);
        assert!(!spec.remove);
        assert_eq!(
            spec.env,
            vec![
                (PORT_ENV.to_string(), "6000".to_string()),
                ("PX4_HOME_LAT".to_string(), "47.39".to_string()),
            ]
        );
    }

    #[test]
    fn sessions_are_unique() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.id, b.id);
        assert!(a.started_at <= b.started_at);
        assert_eq!(a.version.protocol, crate::PROTOCOL_VERSION);
    }
}
