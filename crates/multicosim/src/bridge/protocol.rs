//! Wire protocol types for host-controller communication.
//!
//! One channel, one exchange:
//! - **Host → controller**: exactly one `start` envelope carrying the config
//! - **Controller → host**: exactly one terminal `result` or `error` envelope
//!
//! The envelope body is opaque JSON so the transport never needs to know the
//! config or result types. Typed access goes through [`Envelope::body_as`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::codec::CodecError;
use crate::version::PROTOCOL_VERSION;

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Configuration sent by the host to begin controller work.
    Start,
    /// Terminal success reply.
    Result,
    /// Terminal failure reply.
    Error,
}

impl MessageKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Result => "result",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

/// A single framed message on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub kind: MessageKind,
    pub body: serde_json::Value,
}

impl Envelope {
    /// Encode a typed payload under the given kind.
    pub fn encode<T: Serialize>(kind: MessageKind, value: &T) -> Result<Self, CodecError> {
        let body =
            serde_json::to_value(value).map_err(|source| CodecError::Encode { kind, source })?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            kind,
            body,
        })
    }

    pub fn start<C: Serialize>(config: &C) -> Result<Self, CodecError> {
        Self::encode(MessageKind::Start, config)
    }

    pub fn result<R: Serialize>(result: &R) -> Result<Self, CodecError> {
        Self::encode(MessageKind::Result, result)
    }

    /// Error replies carry a plain description and cannot fail to encode.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: MessageKind::Error,
            body: serde_json::json!({ "message": message.into() }),
        }
    }

    pub fn check_version(&self) -> Result<(), CodecError> {
        if self.version != PROTOCOL_VERSION {
            return Err(CodecError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: self.version,
            });
        }
        Ok(())
    }

    /// Decode the body as `T`, checking the protocol version first.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.check_version()?;
        T::deserialize(&self.body).map_err(|source| CodecError::Decode {
            kind: self.kind,
            source,
        })
    }

    /// Interpret a `start` envelope as the typed config.
    pub fn into_start<C: DeserializeOwned>(self) -> Result<C, CodecError> {
        match self.kind {
            MessageKind::Start => self.body_as(),
            actual => Err(CodecError::UnexpectedKind {
                expected: "start",
                actual,
            }),
        }
    }

    /// Interpret a terminal envelope as a typed reply.
    pub fn into_reply<R: DeserializeOwned>(self) -> Result<Reply<R>, CodecError> {
        match self.kind {
            MessageKind::Result => self.body_as().map(Reply::Result),
            MessageKind::Error => self
                .body_as::<ErrorBody>()
                .map(|body| Reply::Error(body.message)),
            actual => Err(CodecError::UnexpectedKind {
                expected: "result or error",
                actual,
            }),
        }
    }
}

/// Terminal reply as seen by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<R> {
    Result(R),
    Error(String),
}
