//! Patches describe only the sub-trees of room state that changed in one
//! accepted transition. The revision they carry is the sole ordering
//! primitive clients use to detect staleness and gaps.

use crate::state::{PlacedItem, PlayerPresence, RoomState, TileEntity};
use crate::types::{GridPos, ItemCode, ItemInstanceId, SessionId, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub revision: u64,
    pub tiles: Vec<(GridPos, TileEntity)>,
    pub items_upserted: Vec<PlacedItem>,
    pub items_removed: Vec<ItemInstanceId>,
    /// New absolute stack counts, not deltas.
    pub inventory: Vec<(UserId, ItemCode, u32)>,
    /// New absolute balances, not deltas.
    pub wallets: Vec<(UserId, u64)>,
    pub presences_upserted: Vec<PlayerPresence>,
    pub presences_removed: Vec<SessionId>,
}

impl Patch {
    pub fn new(revision: u64) -> Self {
        Self {
            revision,
            tiles: Vec::new(),
            items_upserted: Vec::new(),
            items_removed: Vec::new(),
            inventory: Vec::new(),
            wallets: Vec::new(),
            presences_upserted: Vec::new(),
            presences_removed: Vec::new(),
        }
    }

    /// True if the patch carries no state change at all (e.g. the terminal
    /// result of a discarded stale movement intent).
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
            && self.items_upserted.is_empty()
            && self.items_removed.is_empty()
            && self.inventory.is_empty()
            && self.wallets.is_empty()
            && self.presences_upserted.is_empty()
            && self.presences_removed.is_empty()
    }

    /// Applies the patch to a replicated state view, adopting the patch's
    /// revision. Values are absolute, so re-applying the same patch is
    /// harmless.
    pub fn apply_to(&self, state: &mut RoomState) {
        for (pos, tile) in &self.tiles {
            state.set_tile(*pos, tile.clone());
        }
        for item in &self.items_upserted {
            state.items.insert(item.instance, item.clone());
        }
        for instance in &self.items_removed {
            state.items.remove(instance);
        }
        for (user, item, count) in &self.inventory {
            state.set_inventory_count(*user, item.clone(), *count);
        }
        for (user, balance) in &self.wallets {
            state.wallets.insert(*user, *balance);
        }
        for presence in &self.presences_upserted {
            state.presences.insert(presence.session, presence.clone());
        }
        for session in &self.presences_removed {
            state.presences.remove(session);
        }
        state.revision = self.revision;
    }
}
