//! Shared library for the homestead room backend: the wire protocol, the
//! canonical room state model, action payloads, the rejection taxonomy, and
//! the read-only item catalog. Both the authoritative server and the
//! predicting client build on these types, which keeps prediction and
//! reconciliation working against the exact same data model.

pub mod action;
pub mod catalog;
pub mod patch;
pub mod protocol;
pub mod reject;
pub mod state;
pub mod types;

pub use action::{ActionKind, ActionPayload, ActionRequest, RetentionClass};
pub use catalog::{Catalog, ItemDef, ItemDefKind};
pub use patch::Patch;
pub use protocol::{Packet, MAX_DATAGRAM, PROTOCOL_VERSION};
pub use reject::{Recovery, RejectCode, Rejection};
pub use state::{
    EffectKind, PlacedItem, PlacementCheck, PlayerPresence, Role, RoomState, TileEntity,
    TransientEffect,
};
pub use types::{
    footprints_overlap, occupied_cells, ActionId, Footprint, GridPos, ItemCode, ItemInstanceId,
    RoomId, Rotation, SessionId, UserId,
};
