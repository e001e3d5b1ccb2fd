//! Lifecycle state of a communication context.

use serde::{Deserialize, Serialize};

/// One-shot lifecycle: `Open → Closing → Closed`, or `Open → Closed` directly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextState {
    /// Accepting new proxies, adapters and dispatches
    #[default]
    Open,
    /// Shutdown started: no new dispatches, in-flight work draining
    Closing,
    /// Destroyed: all resources released
    Closed,
}

impl ContextState {
    pub fn is_open(self) -> bool {
        self == Self::Open
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Whether `self → next` is a forward transition. Staying put is not.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Closing) | (Self::Open, Self::Closed) | (Self::Closing, Self::Closed)
        )
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => f.write_str("open"),
            Self::Closing => f.write_str("closing"),
            Self::Closed => f.write_str("closed"),
        }
    }
}
