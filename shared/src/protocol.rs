//! Versioned wire protocol between client and server.
//!
//! A single serde/bincode `Packet` enum covers both directions, as in the
//! rest of the codebase's channel messages. Server pushes carry an
//! always-increasing per-room revision inside the patch; clients detect
//! gaps and request a full resync rather than merge unknown diffs.

use crate::action::ActionRequest;
use crate::patch::Patch;
use crate::reject::Rejection;
use crate::state::{Role, RoomState, TransientEffect};
use crate::types::{ActionId, SessionId, UserId};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

/// Datagram size budget; full room snapshots must fit.
pub const MAX_DATAGRAM: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // Client -> server
    Join {
        protocol_version: u32,
        /// Opaque credential; the server resolves the actor identity from
        /// it and never trusts a client-supplied user id.
        auth_token: String,
    },
    Action {
        request: ActionRequest,
    },
    ResyncRequest,
    Leave,

    // Server -> client
    Joined {
        session_id: SessionId,
        user_id: UserId,
        role: Role,
        snapshot: RoomState,
    },
    JoinRejected {
        reason: String,
    },
    ActionResult {
        action_id: ActionId,
        result: Result<Patch, Rejection>,
    },
    StatePush {
        patch: Patch,
    },
    Snapshot {
        snapshot: RoomState,
    },
    Effect {
        effect: TransientEffect,
    },
    Kicked {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionPayload;
    use crate::types::{ActionId, GridPos};

    #[test]
    fn test_action_envelope_roundtrip() {
        let packet = Packet::Action {
            request: ActionRequest {
                action_id: ActionId::generate(),
                base_revision: Some(41),
                payload: ActionPayload::HarvestCrop {
                    pos: GridPos::new(3, 5),
                },
            },
        };
        let bytes = bincode::serialize(&packet).unwrap();
        assert!(bytes.len() < MAX_DATAGRAM);
        let decoded: Packet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_malformed_datagram_is_rejected() {
        let packet = Packet::ResyncRequest;
        let bytes = bincode::serialize(&packet).unwrap();
        let truncated = &bytes[..bytes.len().saturating_sub(1)];
        assert!(bincode::deserialize::<Packet>(truncated).is_err());
        assert!(bincode::deserialize::<Packet>(&[]).is_err());
    }
}
