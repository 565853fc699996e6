//! Version information for multicosim.

/// Crate version from Cargo.toml
pub const MULTICOSIM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version carried in every envelope.
///
/// Bump when the envelope shape or message semantics change. Peers reject
/// envelopes with a different version instead of guessing.
pub const PROTOCOL_VERSION: u32 = 1;

/// Version information for a running host or controller.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    pub multicosim: &'static str,
    pub protocol: u32,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            multicosim: MULTICOSIM_VERSION,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
