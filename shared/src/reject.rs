//! Structured rejections with stable reason codes and a suggested recovery
//! action. Every terminal failure carries one of these; nothing is silently
//! dropped.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable reason code for a rejected action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RejectCode {
    #[error("permission denied")]
    PermissionDenied,
    #[error("not ready until {ready_at_ms}ms")]
    NotReady { ready_at_ms: u64 },
    #[error("invalid target")]
    InvalidTarget,
    #[error("target occupied")]
    Occupied,
    #[error("entity not owned by actor")]
    NotOwned,
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("item not in inventory")]
    OutOfStock,
    #[error("unknown item code")]
    UnknownItem,
    #[error("stale revision: current is {current}")]
    StaleRevision { current: u64 },
    #[error("persistence degraded; economic actions temporarily rejected")]
    PersistenceDegraded,
    #[error("rate limited")]
    RateLimited,
}

/// What the client should do about a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recovery {
    /// Terminal for this intent; a new logical intent may be attempted.
    None,
    /// Request a full snapshot, then retry with fresh intent.
    Resync,
    /// Back off and try a new intent later.
    Backoff,
    /// Surface an insufficient-funds indication.
    ShowFunds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    pub code: RejectCode,
    pub recovery: Recovery,
}

impl Rejection {
    pub fn new(code: RejectCode) -> Self {
        let recovery = match &code {
            RejectCode::StaleRevision { .. } => Recovery::Resync,
            RejectCode::PersistenceDegraded | RejectCode::RateLimited => Recovery::Backoff,
            RejectCode::InsufficientFunds { .. } => Recovery::ShowFunds,
            _ => Recovery::None,
        };
        Self { code, recovery }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.code.fmt(f)
    }
}
