//! Host-controller channel.
//!
//! - **protocol**: envelope and message kinds
//! - **codec**: length-prefixed JSON framing
//! - **transport**: TCP listener/connection with connect backoff

pub mod codec;
pub mod protocol;
pub mod transport;
