//! Local subprocess launcher.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use super::logs::{LineSink, LogTail, Stream, pump};
use super::{LaunchError, LaunchSpec, Launcher, Process, Readiness, probe_port};

/// Runs `spec.image` as a program on this host.
///
/// Ports are not remapped: a process listening on port `p` is reached at
/// `127.0.0.1:p`.
#[derive(Debug, Clone, Default)]
pub struct CommandLauncher {
    working_dir: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn Process>, LaunchError> {
        let mut command = Command::new(&spec.image);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: spec.image.clone(),
            source,
        })?;

        let pid = child.id();
        let id = match pid {
            Some(pid) => format!("{}:{}", spec.role, pid),
            None => spec.role.to_string(),
        };

        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let tail = LogTail::new(spec.log_tail);
        let sink = LineSink {
            role: spec.role,
            process_id: id.clone(),
            tail: tail.clone(),
            ready: match &spec.readiness {
                Readiness::LogLine(pattern) => Some((pattern.clone(), Arc::clone(&ready_tx))),
                _ => None,
            },
        };
        drop(ready_tx);

        if let Some(stdout) = child.stdout.take() {
            pump(stdout, Stream::Stdout, sink.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, Stream::Stderr, sink);
        }

        tracing::debug!(process_id = %id, program = %spec.image, args = ?spec.args, "Spawned local process");

        Ok(Box::new(LocalProcess {
            id,
            child,
            pid,
            readiness: spec.readiness.clone(),
            ready_rx,
            tail,
            exit: None,
        }))
    }
}

struct LocalProcess {
    id: String,
    child: Child,
    pid: Option<u32>,
    readiness: Readiness,
    ready_rx: watch::Receiver<bool>,
    tail: LogTail,
    exit: Option<i32>,
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

impl LocalProcess {
    async fn wait_exit(&mut self) -> Option<i32> {
        if self.exit.is_some() {
            return self.exit;
        }
        match self.child.wait().await {
            Ok(status) => {
                self.exit = Some(exit_code(status));
                self.exit
            }
            Err(e) => {
                tracing::warn!(process_id = %self.id, error = %e, "Failed to wait for process");
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

    #[cfg(unix)]
    fn terminate(&mut self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(process_id = %self.id, error = %e, "SIGTERM failed");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> bool {
        false
    }
}

#[async_trait]
impl Process for LocalProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn endpoint(&self, port: u16) -> Option<SocketAddr> {
        Some((Ipv4Addr::LOCALHOST, port).into())
    }

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
                        // Output closed without the line; only exit is left.
                        Err(self.exited_early().await)
                    }
                    _ = self.child.wait() => {
                        let seen = *self.ready_rx.borrow();
                        if seen {
                            return Ok(());
                        }
                        Err(self.exited_early().await)
                    }
                }
            }
            Readiness::Port(port) => {
                let addr: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();
                tokio::select! {
                    _ = probe_port(addr) => Ok(()),
                    _ = self.child.wait() => Err(self.exited_early().await),
                }
            }
        }
    }

    async fn exit_status(&mut self) -> Option<i32> {
        if self.exit.is_some() {
            return self.exit;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(exit_code(status));
                self.exit
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(process_id = %self.id, error = %e, "Failed to poll process");
                None
            }
        }
    }

    async fn stop(&mut self, grace: Duration) -> Result<Option<i32>, LaunchError> {
        if let Some(code) = self.exit_status().await {
            tracing::debug!(process_id = %self.id, code, "Process already exited");
            return Ok(Some(code));
        }

        if self.terminate() {
            if let Ok(code) = tokio::time::timeout(grace, self.wait_exit()).await {
                return Ok(code);
            }
            tracing::warn!(process_id = %self.id, ?grace, "Process ignored SIGTERM, killing");
        }

        self.child
            .kill()
            .await
            .map_err(|e| LaunchError::Stop(format!("{}: {}", self.id, e)))?;
        Ok(self.wait_exit().await)
    }

    fn start_kill(&mut self) {
        if self.exit.is_none()
            && let Err(e) = self.child.start_kill()
        {
            tracing::debug!(process_id = %self.id, error = %e, "start_kill failed");
        }
    }

    fn logs(&self) -> Vec<String> {
        self.tail.snapshot()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{ProcessHandle, ProcessState, Role};

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new(Role::Simulator, "sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn missing_program_fails_fast() {
        let spec = LaunchSpec::new(Role::Simulator, "/nonexistent/multicosim-sim");
        let err = CommandLauncher::new().launch(&spec).await.err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[tokio::test]
    async fn log_line_readiness() {
        let spec = sh("echo booting; echo world ready; sleep 30")
            .with_readiness(Readiness::LogLine("world ready".to_string()));
        let mut handle = ProcessHandle::launch(&CommandLauncher::new(), &spec)
            .await
            .unwrap();
        handle.await_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.state(), &ProcessState::Ready);

        handle.stop(Duration::from_secs(5)).await.unwrap();
        // sh dies from SIGTERM
        assert_eq!(handle.exit_status().await, Some(128 + 15));
    }

    #[tokio::test]
    async fn non_utf8_output_does_not_kill_process() {
        let spec = sh(r"printf 'bad \377 byte\n'; echo world ready; sleep 30")
            .with_readiness(Readiness::LogLine("world ready".to_string()));
        let mut handle = ProcessHandle::launch(&CommandLauncher::new(), &spec)
            .await
            .unwrap();
        handle.await_ready(Duration::from_secs(5)).await.unwrap();

        assert_eq!(handle.exit_status().await, None);
        assert_eq!(handle.logs(), vec!["bad \u{fffd} byte", "world ready"]);
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn early_exit_reports_status_and_tail() {
        let spec = sh("echo 'fatal: no world'; exit 3")
            .with_readiness(Readiness::LogLine("never printed".to_string()));
        let mut handle = ProcessHandle::launch(&CommandLauncher::new(), &spec)
            .await
            .unwrap();
        let err = handle
            .await_ready(Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            LaunchError::ExitedEarly { status, logs } => {
                assert_eq!(status, Some(3));
                assert_eq!(logs, vec!["fatal: no world"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(handle.state(), &ProcessState::Exited(3));
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_escalates_to_kill() {
        let spec = sh("trap '' TERM; echo up; while true; do sleep 1; done")
            .with_readiness(Readiness::LogLine("up".to_string()));
        let mut handle = ProcessHandle::launch(&CommandLauncher::new(), &spec)
            .await
            .unwrap();
        handle.await_ready(Duration::from_secs(5)).await.unwrap();

        handle.stop(Duration::from_millis(200)).await.unwrap();
        assert_eq!(handle.exit_status().await, Some(128 + 9));
    }

    #[tokio::test]
    async fn stop_after_exit_is_safe() {
        let mut handle = ProcessHandle::launch(&CommandLauncher::new(), &sh("exit 0"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop(Duration::from_secs(1)).await.unwrap();
        handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.exit_status().await, Some(0));
    }
}
