//! Runtime and wire protocol versions.

use serde::{Deserialize, Serialize};

/// Orbit version from Cargo.toml
pub const ORBIT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire protocol version announced in the connection-validation frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self { major: 1, minor: 0 };

    /// Peers interoperate when the major versions agree.
    pub fn is_compatible_with(self, other: Self) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
