//! Reference controller entry point.
//!
//! Replies with `{"value": <value>}` after an optional delay, or fails with
//! `error` when the config asks for it. Used by the integration tests and as
//! a template for real controllers.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use multicosim::{ServiceState, VersionInfo, init_tracing, wrap_as_service};

#[derive(Debug, Deserialize)]
struct EchoConfig {
    world: String,
    #[serde(default)]
    value: i64,
    #[serde(default)]
    delay_ms: u64,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct EchoResult {
    world: String,
    value: i64,
}

fn echo(config: EchoConfig) -> Result<EchoResult, String> {
    if config.delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(config.delay_ms));
    }
    match config.error {
        Some(message) => Err(message),
        None => Ok(EchoResult {
            world: config.world,
            value: config.value,
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let version = VersionInfo::new();
    tracing::info!(
        multicosim = version.multicosim,
        protocol = version.protocol,
        "Echo controller starting"
    );

    let state = wrap_as_service(echo)
        .run_from_env()
        .await
        .context("echo controller failed")?;

    if let ServiceState::Failed(message) = &state {
        tracing::info!(error = %message, "Reported failure to host");
    }
    Ok(())
}
