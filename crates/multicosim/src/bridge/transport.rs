//! TCP transport for the host-controller channel.
//!
//! The controller binds a [`Listener`]; the host opens a [`Connection`] with
//! bounded exponential backoff while the controller comes up. Each side frames
//! [`Envelope`]s with [`JsonCodec`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::codec::Framed;

use super::codec::{self, CodecError, JsonCodec};
use super::protocol::Envelope;

/// Port controllers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 5556;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("could not connect to {address} after {attempts} attempts over {elapsed:?}: {last}")]
    ConnectExhausted {
        address: SocketAddr,
        attempts: u32,
        elapsed: Duration,
        last: io::Error,
    },

    #[error("peer disconnected before completing the exchange")]
    Disconnected,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Failure moving a frame: either the pipe broke or the frame was bad.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Backoff schedule for connecting to a controller that may not be listening yet.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Total time allowed across all attempts.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            multiplier: 2,
            budget: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(self.multiplier.max(1))
            .min(self.max_delay)
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
    )
}

/// Pick an unused loopback port for a fresh per-session bind point.
///
/// The port is released before returning, so a concurrent process could in
/// principle claim it first; the controller's bind then fails loudly.
pub fn free_port() -> io::Result<u16> {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Bind the controller end of a channel.
pub async fn bind(address: SocketAddr) -> Result<Listener, TransportError> {
    Listener::bind(address).await
}

/// Connect the host end of a channel, backing off per `policy`.
pub async fn connect(address: SocketAddr, policy: &RetryPolicy) -> Result<Connection, TransportError> {
    Connection::connect(address, policy).await
}

/// Server side of the channel.
pub struct Listener {
    inner: TcpListener,
    address: SocketAddr,
}

impl Listener {
    pub async fn bind(address: SocketAddr) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(address)
            .await
            .map_err(|source| TransportError::Bind { address, source })?;
        let address = inner.local_addr()?;
        tracing::debug!(%address, "Channel listener bound");
        Ok(Self { inner, address })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        tracing::debug!(%peer, "Accepted channel connection");
        Connection::from_stream(stream, peer)
    }
}

/// One end of an established channel.
pub struct Connection {
    framed: Framed<TcpStream, JsonCodec<Envelope>>,
    peer: SocketAddr,
}

impl Connection {
    fn from_stream(stream: TcpStream, peer: SocketAddr) -> Result<Self, TransportError> {
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, JsonCodec::new()),
            peer,
        })
    }

    /// Connect to a listener, retrying refused connections per `policy`.
    pub async fn connect(address: SocketAddr, policy: &RetryPolicy) -> Result<Self, TransportError> {
        let started = Instant::now();
        let deadline = started + policy.budget;
        let mut delay = policy.initial_delay;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    tracing::debug!(%address, attempts, "Connected to channel");
                    return Self::from_stream(stream, address);
                }
                Err(e) if is_retryable(&e) => {
                    let now = Instant::now();
                    if now + delay > deadline {
                        return Err(TransportError::ConnectExhausted {
                            address,
                            attempts,
                            elapsed: now - started,
                            last: e,
                        });
                    }
                    tracing::trace!(%address, attempts, ?delay, error = %e, "Connect refused, backing off");
                    tokio::time::sleep(delay).await;
                    delay = policy.next_delay(delay);
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Largest frame this end will send or accept.
    pub fn max_frame_length(&self) -> usize {
        self.framed.codec().max_frame_length()
    }

    pub fn set_max_frame_length(&mut self, max_frame_length: usize) {
        self.framed.codec_mut().set_max_frame_length(max_frame_length);
    }

    /// Send one envelope.
    ///
    /// A frame over the size limit is a [`CodecError::FrameTooLarge`] and
    /// leaves the connection usable for a smaller reply.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), ChannelError> {
        tracing::trace!(peer = %self.peer, kind = %envelope.kind, "Sending envelope");
        self.framed.send(envelope).await.map_err(|e| match e.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                TransportError::Disconnected.into()
            }
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
                codec::codec_error(e).into()
            }
            _ => TransportError::Io(e).into(),
        })
    }

    /// Wait for the next envelope.
    ///
    /// A clean close before any frame is [`TransportError::Disconnected`]; a
    /// frame that is not a valid envelope is [`CodecError::Malformed`].
    pub async fn receive(&mut self) -> Result<Envelope, ChannelError> {
        match self.framed.next().await {
            Some(Ok(envelope)) => {
                tracing::trace!(peer = %self.peer, kind = %envelope.kind, "Received envelope");
                Ok(envelope)
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(CodecError::Malformed(e.to_string()).into())
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::ConnectionReset => {
                Err(TransportError::Disconnected.into())
            }
            Some(Err(e)) => Err(TransportError::Io(e).into()),
            None => Err(TransportError::Disconnected.into()),
        }
    }

    /// Flush and shut down the write side so the peer sees a clean close.
    pub async fn close(mut self) -> Result<(), TransportError> {
        SinkExt::<Envelope>::close(&mut self.framed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    async fn loopback_listener() -> Listener {
        Listener::bind((Ipv4Addr::LOCALHOST, 0).into()).await.unwrap()
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(5))
            .with_max_delay(Duration::from_millis(20))
            .with_budget(Duration::from_millis(200))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        let d1 = policy.next_delay(policy.initial_delay);
        assert_eq!(d1, Duration::from_millis(100));
        let mut d = d1;
        for _ in 0..10 {
            d = policy.next_delay(d);
        }
        assert_eq!(d, Duration::from_secs(1));
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port().unwrap(), 0);
    }

    #[tokio::test]
    async fn exchange_over_loopback() {
        let listener = loopback_listener().await;
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let start = conn.receive().await.unwrap();
            assert_eq!(start.body, json!({"world": "w1"}));
            conn.send(Envelope::result(&json!({"value": 42})).unwrap())
                .await
                .unwrap();
        });

        let mut conn = Connection::connect(addr, &quick_policy()).await.unwrap();
        conn.send(Envelope::start(&json!({"world": "w1"})).unwrap())
            .await
            .unwrap();
        let reply = conn.receive().await.unwrap();
        assert_eq!(reply.body, json!({"value": 42}));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_retries_until_listener_appears() {
        let port = free_port().unwrap();
        let addr: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();

        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let listener = Listener::bind(addr).await.unwrap();
            let _conn = listener.accept().await.unwrap();
        });

        let conn = Connection::connect(addr, &quick_policy()).await.unwrap();
        assert_eq!(conn.peer_addr(), addr);
        late.await.unwrap();
    }

    #[tokio::test]
    async fn connect_gives_up_after_budget() {
        let port = free_port().unwrap();
        let addr: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();

        let err = Connection::connect(addr, &quick_policy())
            .await
            .err()
            .unwrap();
        match err {
            TransportError::ConnectExhausted { attempts, .. } => assert!(attempts > 1),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn close_before_frame_is_disconnect() {
        let listener = loopback_listener().await;
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let conn = Connection::connect(addr, &quick_policy()).await.unwrap();
            conn.close().await.unwrap();
        });

        let mut conn = listener.accept().await.unwrap();
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Transport(TransportError::Disconnected)
        ));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_frame_is_codec_error() {
        let listener = loopback_listener().await;
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let body = b"{\"nope\":";
            stream.write_u32(body.len() as u32).await.unwrap();
            stream.write_all(body).await.unwrap();
            stream.flush().await.unwrap();
            stream
        });

        let mut conn = listener.accept().await.unwrap();
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, ChannelError::Codec(CodecError::Malformed(_))));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn oversize_send_leaves_connection_usable() {
        let listener = loopback_listener().await;
        let addr = listener.local_addr();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            conn.receive().await.unwrap()
        });

        let mut conn = Connection::connect(addr, &quick_policy()).await.unwrap();
        conn.set_max_frame_length(1024);
        assert_eq!(conn.max_frame_length(), 1024);

        let big = Envelope::result(&"x".repeat(4096)).unwrap();
        let err = conn.send(big).await.unwrap_err();
        assert!(matches!(
            err,
            ChannelError::Codec(CodecError::FrameTooLarge { limit: 1024, .. })
        ));

        conn.send(Envelope::error("too large")).await.unwrap();
        let received = server.await.unwrap();
        assert_eq!(received.body, json!({"message": "too large"}));
    }

    #[tokio::test]
    async fn oversize_inbound_frame_is_codec_error() {
        let listener = loopback_listener().await;
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut conn = Connection::connect(addr, &quick_policy()).await.unwrap();
            conn.send(Envelope::result(&"x".repeat(4096)).unwrap())
                .await
                .unwrap();
            conn
        });

        let mut conn = listener.accept().await.unwrap();
        conn.set_max_frame_length(1024);
        let err = conn.receive().await.unwrap_err();
        assert!(matches!(err, ChannelError::Codec(CodecError::Malformed(_))));
        drop(client.await.unwrap());
    }
}
