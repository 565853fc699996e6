//! Framed codec for host-controller communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (TCP sockets, pipes, in-memory duplex).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Envelope, MessageKind};

/// Frames above this size are logged; trajectories can get large.
const LARGE_FRAME_BYTES: usize = 1_000_000;

/// Largest frame either side accepts unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {kind} payload: {source}")]
    Encode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {kind} payload: {source}")]
    Decode {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },

    /// The frame itself is not a valid envelope.
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("unexpected {actual} message, expected {expected}")]
    UnexpectedKind {
        expected: &'static str,
        actual: MessageKind,
    },

    #[error("frame too large: {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
}

/// Codec that frames messages with length prefix and serializes with JSON.
///
/// Wraps LengthDelimitedCodec and adds serde_json serialization.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max_frame_length)
                .new_codec(),
            max_frame_length,
            _phantom: PhantomData,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    pub fn set_max_frame_length(&mut self, max_frame_length: usize) {
        self.inner.set_max_frame_length(max_frame_length);
        self.max_frame_length = max_frame_length;
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        // Rejected before anything reaches `dst`, so the stream stays usable.
        if json_len > self.max_frame_length {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                CodecError::FrameTooLarge {
                    size: json_len,
                    limit: self.max_frame_length,
                },
            ));
        }
        if json_len > LARGE_FRAME_BYTES {
            tracing::info!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Encode a typed payload into a complete length-prefixed frame.
pub fn encode<T: Serialize>(kind: MessageKind, value: &T) -> Result<Bytes, CodecError> {
    let envelope = Envelope::encode(kind, value)?;
    let mut buf = BytesMut::new();
    JsonCodec::<Envelope>::new()
        .encode(envelope, &mut buf)
        .map_err(codec_error)?;
    Ok(buf.freeze())
}

/// Recover the typed error an encoder wrapped in `io::Error`.
pub(crate) fn codec_error(e: io::Error) -> CodecError {
    let message = e.to_string();
    match e.into_inner().map(|inner| inner.downcast::<CodecError>()) {
        Some(Ok(codec)) => *codec,
        _ => CodecError::Malformed(message),
    }
}

/// Decode one complete frame into its kind tag and opaque body.
///
/// Version is checked here; the body is left untyped for the caller.
pub fn decode(frame: &[u8]) -> Result<(MessageKind, serde_json::Value), CodecError> {
    let mut buf = BytesMut::from(frame);
    let envelope = JsonCodec::<Envelope>::new()
        .decode(&mut buf)
        .map_err(|e| CodecError::Malformed(e.to_string()))?
        .ok_or_else(|| CodecError::Malformed("incomplete frame".to_string()))?;
    envelope.check_version()?;
    Ok((envelope.kind, envelope.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Config {
        world: String,
        step_size: f64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        time: f64,
        position: [f64; 3],
    }

    #[test]
    fn codec_roundtrip_envelope() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();

        let env = Envelope::start(&json!({"world": "w1"})).unwrap();
        codec.encode(env.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_waits_for_full_frame() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        codec.encode(Envelope::error("late"), &mut buf).unwrap();

        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.kind, MessageKind::Error);
    }

    #[test]
    fn codec_rejects_non_json_frame() {
        let mut codec = JsonCodec::<Envelope>::new();
        let mut buf = BytesMut::new();
        LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec()
            .encode(Bytes::from_static(b"not json"), &mut buf)
            .unwrap();

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn encode_decode_typed_config() {
        let config = Config {
            world: "generated".to_string(),
            step_size: 0.001,
        };
        let frame = encode(MessageKind::Start, &config).unwrap();
        let (kind, body) = decode(&frame).unwrap();

        assert_eq!(kind, MessageKind::Start);
        assert_eq!(serde_json::from_value::<Config>(body).unwrap(), config);
    }

    #[test]
    fn encode_decode_typed_result() {
        let samples = vec![
            Sample {
                time: 0.0,
                position: [0.0, 0.0, 0.0],
            },
            Sample {
                time: 0.25,
                position: [0.1, -0.2, 25.0],
            },
        ];
        let frame = encode(MessageKind::Result, &samples).unwrap();
        let (kind, body) = decode(&frame).unwrap();

        assert_eq!(kind, MessageKind::Result);
        assert_eq!(serde_json::from_value::<Vec<Sample>>(body).unwrap(), samples);
    }

    #[test]
    fn decode_truncated_frame_is_malformed() {
        let frame = encode(MessageKind::Result, &json!({"value": 42})).unwrap();
        let err = decode(&frame[..frame.len() - 1]).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn decode_checks_version() {
        let mut buf = BytesMut::new();
        JsonCodec::<serde_json::Value>::new()
            .encode(json!({"version": 99, "kind": "start", "body": {}}), &mut buf)
            .unwrap();
        let err = decode(&buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::VersionMismatch {
                expected: 1,
                actual: 99
            }
        ));
    }

    #[test]
    fn oversize_frame_rejected_before_writing() {
        let mut codec = JsonCodec::<Envelope>::with_max_frame_length(64);
        let mut buf = BytesMut::new();

        let env = Envelope::result(&"x".repeat(256)).unwrap();
        let err = codec_error(codec.encode(env, &mut buf).unwrap_err());

        match err {
            CodecError::FrameTooLarge { size, limit } => {
                assert!(size > 256);
                assert_eq!(limit, 64);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(buf.is_empty());

        codec.encode(Envelope::error("short"), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().kind, MessageKind::Error);
    }

    #[test]
    fn frame_limit_applies_to_decoding() {
        let mut buf = BytesMut::new();
        JsonCodec::<Envelope>::new()
            .encode(Envelope::result(&"x".repeat(256)).unwrap(), &mut buf)
            .unwrap();

        let mut codec = JsonCodec::<Envelope>::new();
        codec.set_max_frame_length(64);
        assert_eq!(codec.max_frame_length(), 64);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn default_limit_fits_large_results() {
        let codec = JsonCodec::<Envelope>::new();
        assert!(codec.max_frame_length() > 8 * 1024 * 1024);
    }
}
