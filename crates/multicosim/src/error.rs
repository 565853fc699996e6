//! Session-level failures.

use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::bridge::transport::TransportError;
use crate::process::logs::fmt_tail;
use crate::process::{LaunchError, Role};

/// Point in a session where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SimulatorStart,
    ControllerStart,
    BuildConfig,
    Connect,
    Encode,
    Send,
    Receive,
    Decode,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SimulatorStart => "simulator_start",
            Self::ControllerStart => "controller_start",
            Self::BuildConfig => "build_config",
            Self::Connect => "connect",
            Self::Encode => "encode",
            Self::Send => "send",
            Self::Receive => "receive",
            Self::Decode => "decode",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A process failed to start or never became ready.
    #[error("{role} failed to launch: {source}")]
    Launch {
        role: Role,
        #[source]
        source: LaunchError,
    },

    #[error("transport failure during {stage}: {source}")]
    Transport {
        stage: Stage,
        #[source]
        source: TransportError,
    },

    #[error("codec failure during {stage}: {source}")]
    Codec {
        stage: Stage,
        #[source]
        source: CodecError,
    },

    /// The controller function returned an error.
    #[error("controller reported failure: {0}")]
    Controller(String),

    /// The executor function failed to build a config.
    #[error("failed to build controller config: {0}")]
    ConfigBuild(String),

    #[error("timed out during {stage} after {after:?}")]
    Timeout { stage: Stage, after: Duration },

    /// A ready process died while the session was waiting on the controller.
    #[error("{role} exited with status {status} during the session{}", fmt_tail(.logs))]
    Exited {
        role: Role,
        status: i32,
        logs: Vec<String>,
    },
}

impl SessionError {
    /// Failures raised by user code rather than the harness.
    pub fn is_application(&self) -> bool {
        matches!(self, Self::Controller(_) | Self::ConfigBuild(_))
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::Launch {
                role: Role::Simulator,
                ..
            } => Stage::SimulatorStart,
            Self::Launch {
                role: Role::Controller,
                ..
            } => Stage::ControllerStart,
            Self::Transport { stage, .. } | Self::Codec { stage, .. } | Self::Timeout { stage, .. } => {
                *stage
            }
            Self::Controller(_) | Self::Exited { .. } => Stage::Receive,
            Self::ConfigBuild(_) => Stage::BuildConfig,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_names_role() {
        let err = SessionError::Launch {
            role: Role::Simulator,
            source: LaunchError::ReadyTimeout {
                timeout: Duration::from_millis(200),
                logs: vec!["loading world".to_string()],
            },
        };
        let msg = err.to_string();
        assert!(msg.starts_with("simulator failed to launch: not ready after 200ms"));
        assert!(msg.ends_with("loading world"));
        assert_eq!(err.stage(), Stage::SimulatorStart);
        assert!(!err.is_application());
    }

    #[test]
    fn application_errors() {
        let err = SessionError::Controller("mission upload failed".to_string());
        assert!(err.is_application());
        assert_eq!(
            err.to_string(),
            "controller reported failure: mission upload failed"
        );
        assert!(SessionError::ConfigBuild("no waypoints".to_string()).is_application());
    }

    #[test]
    fn timeout_message() {
        let err = SessionError::Timeout {
            stage: Stage::Receive,
            after: Duration::from_secs(2),
        };
        assert_eq!(err.to_string(), "timed out during receive after 2s");
        assert_eq!(err.stage(), Stage::Receive);
    }

    #[test]
    fn exited_names_role_and_tail() {
        let err = SessionError::Exited {
            role: Role::Simulator,
            status: 139,
            logs: vec!["segmentation fault".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "simulator exited with status 139 during the session\n--- last output ---\nsegmentation fault"
        );
        assert_eq!(err.stage(), Stage::Receive);
        assert!(!err.is_application());
    }

    #[test]
    fn stage_serializes() {
        insta::assert_json_snapshot!(
            [Stage::SimulatorStart, Stage::Connect, Stage::Receive],
            @r#"
        [
          "simulator_start",
          "connect",
          "receive"
        ]
        "#
        );
    }
}
