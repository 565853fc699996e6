//! Controller service - turns a `(config) -> result` function into a one-shot
//! channel server.
//!
//! Lifecycle: bind, announce readiness on stdout, wait for exactly one
//! `start` envelope, run the function on a blocking thread, send one terminal
//! reply, close, return.
//!
//! Anything wrong with the inbound message (bad JSON, wrong kind, wrong
//! version, wrong body type) is answered with an `error` reply; the service
//! never exits without telling the host why.

use std::fmt::Display;
use std::marker::PhantomData;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinSet;

use crate::bridge::codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH};
use crate::bridge::protocol::Envelope;
use crate::bridge::transport::{
    self, ChannelError, Connection, DEFAULT_PORT, Listener, TransportError,
};

/// Printed on stdout once the service is accepting connections.
pub const READY_MARKER: &str = "multicosim: controller listening on";

pub const PORT_ENV: &str = "MULTICOSIM_PORT";
pub const ADDRESS_ENV: &str = "MULTICOSIM_ADDRESS";

/// How long an accepted connection may stay silent before it is dropped.
pub const DEFAULT_START_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Listening,
    Handling,
    Completed,
    Failed(String),
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid bind address {value:?}: {reason}")]
    Address { value: String, reason: String },

    #[error("service already ran")]
    AlreadyRan,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<ChannelError> for ServiceError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Transport(e) => Self::Transport(e),
            ChannelError::Codec(e) => Self::Codec(e),
        }
    }
}

/// A controller function wrapped as a single-exchange service.
pub struct ControllerService<F, C, R, E> {
    f: Arc<F>,
    state: ServiceState,
    start_wait: Duration,
    max_frame_length: usize,
    _types: PhantomData<fn(C) -> Result<R, E>>,
}

/// Wrap `f` so it can be served to a host over the channel.
pub fn wrap_as_service<F, C, R, E>(f: F) -> ControllerService<F, C, R, E>
where
    F: Fn(C) -> Result<R, E> + Send + Sync + 'static,
    C: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    ControllerService {
        f: Arc::new(f),
        state: ServiceState::Created,
        start_wait: DEFAULT_START_WAIT,
        max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        _types: PhantomData,
    }
}

impl<F, C, R, E> ControllerService<F, C, R, E>
where
    F: Fn(C) -> Result<R, E> + Send + Sync + 'static,
    C: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn state(&self) -> &ServiceState {
        &self.state
    }

    /// Bound on how long each accepted connection has to deliver `start`.
    pub fn with_start_wait(mut self, wait: Duration) -> Self {
        self.start_wait = wait;
        self
    }

    /// Largest frame accepted or sent; must match the host's limit.
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Entry point for controller executables.
    ///
    /// The bind address comes from `--address`/`--port`, then
    /// `MULTICOSIM_ADDRESS`/`MULTICOSIM_PORT`, then `0.0.0.0:5556`.
    pub async fn run_from_env(mut self) -> Result<ServiceState, ServiceError> {
        let address = bind_address(std::env::args().skip(1), |key| std::env::var(key).ok())?;
        self.serve(address).await
    }

    /// Bind `address`, print the readiness marker, and handle one exchange.
    pub async fn serve(&mut self, address: SocketAddr) -> Result<ServiceState, ServiceError> {
        let listener = transport::bind(address).await?;
        println!("{} {}", READY_MARKER, listener.local_addr());
        self.serve_listener(listener).await
    }

    /// Handle one exchange on an already-bound listener.
    pub async fn serve_listener(
        &mut self,
        listener: Listener,
    ) -> Result<ServiceState, ServiceError> {
        if self.state != ServiceState::Created {
            return Err(ServiceError::AlreadyRan);
        }
        self.state = ServiceState::Listening;
        tracing::info!(address = %listener.local_addr(), "Controller listening");

        let (mut conn, inbound) = self.await_start(&listener).await?;

        self.state = ServiceState::Handling;
        let outcome = match inbound.and_then(|envelope| envelope.into_start::<C>()) {
            Ok(config) => self.invoke(config).await,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting start message");
                Err(format!("invalid start message: {e}"))
            }
        };
        let (reply, mut failure) = match outcome {
            Ok(envelope) => (envelope, None),
            Err(message) => (Envelope::error(message.clone()), Some(message)),
        };

        match conn.send(reply).await {
            Ok(()) => {}
            Err(ChannelError::Codec(e)) => {
                let message = format!("failed to encode result: {e}");
                tracing::warn!(error = %message, "Reply rejected by codec, sending error instead");
                if let Err(e) = conn.send(Envelope::error(message.clone())).await {
                    self.state = ServiceState::Failed(e.to_string());
                    return Err(e.into());
                }
                failure = Some(message);
            }
            Err(e) => {
                self.state = ServiceState::Failed(e.to_string());
                return Err(e.into());
            }
        }
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "Close after reply failed");
        }

        self.state = match failure {
            Some(message) => {
                tracing::info!(error = %message, "Controller replied with error");
                ServiceState::Failed(message)
            }
            None => {
                tracing::info!("Controller replied with result");
                ServiceState::Completed
            }
        };
        Ok(self.state.clone())
    }

    /// Accept connections until one delivers a frame.
    ///
    /// Each connection waits on its own task, so a silent peer cannot hold up
    /// the host. Peers that close or stay silent past `start_wait` are dropped.
    async fn await_start(
        &self,
        listener: &Listener,
    ) -> Result<(Connection, Result<Envelope, CodecError>), ServiceError> {
        let mut pending = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let mut conn = accepted?;
                    conn.set_max_frame_length(self.max_frame_length);
                    let wait = self.start_wait;
                    pending.spawn(async move {
                        let received = tokio::time::timeout(wait, conn.receive()).await;
                        (conn, received)
                    });
                }
                Some(joined) = pending.join_next() => {
                    let (conn, received) = match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "Connection task failed before start");
                            continue;
                        }
                    };
                    match received {
                        Ok(Ok(envelope)) => return Ok((conn, Ok(envelope))),
                        Ok(Err(ChannelError::Codec(e))) => return Ok((conn, Err(e))),
                        Ok(Err(ChannelError::Transport(TransportError::Disconnected))) => {
                            tracing::debug!(peer = %conn.peer_addr(), "Connection closed before start, still waiting");
                        }
                        Ok(Err(ChannelError::Transport(e))) => {
                            tracing::warn!(peer = %conn.peer_addr(), error = %e, "Connection failed before start, still waiting");
                        }
                        Err(_) => {
                            tracing::debug!(peer = %conn.peer_addr(), wait = ?self.start_wait, "Connection idle before start, dropping");
                        }
                    }
                }
            }
        }
    }

    /// Run the function off the runtime; `Err` carries the reply description.
    async fn invoke(&self, config: C) -> Result<Envelope, String> {
        let f = Arc::clone(&self.f);
        match tokio::task::spawn_blocking(move || f(config)).await {
            Ok(Ok(result)) => {
                Envelope::result(&result).map_err(|e| format!("failed to encode result: {e}"))
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(join) if join.is_panic() => Err(format!(
                "controller panicked: {}",
                panic_message(join.into_panic())
            )),
            Err(join) => Err(format!("controller task lost: {join}")),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resolve the bind address from argv (without the program name) and an
/// environment lookup.
pub fn bind_address<I, V>(args: I, env: V) -> Result<SocketAddr, ServiceError>
where
    I: IntoIterator<Item = String>,
    V: Fn(&str) -> Option<String>,
{
    let mut flag_port = None;
    let mut flag_address = None;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (name, inline) = match arg.split_once('=') {
            Some((name, value)) => (name.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let slot = match name.as_str() {
            "--port" => &mut flag_port,
            "--address" => &mut flag_address,
            _ => continue,
        };
        let value = inline.or_else(|| args.next()).ok_or_else(|| ServiceError::Address {
            value: name.clone(),
            reason: "missing value".to_string(),
        })?;
        *slot = Some(value);
    }

    let port = match flag_port.or_else(|| env(PORT_ENV)) {
        Some(raw) => raw.trim().parse::<u16>().map_err(|e| ServiceError::Address {
            value: raw.clone(),
            reason: e.to_string(),
        })?,
        None => DEFAULT_PORT,
    };

    match flag_address.or_else(|| env(ADDRESS_ENV)) {
        Some(raw) => {
            let raw = raw.trim().to_string();
            if let Ok(addr) = raw.parse::<SocketAddr>() {
                return Ok(addr);
            }
            raw.parse::<IpAddr>()
                .map(|ip| SocketAddr::new(ip, port))
                .map_err(|e| ServiceError::Address {
                    value: raw.clone(),
                    reason: e.to_string(),
                })
        }
        None => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)),
    }
}
