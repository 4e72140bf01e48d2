//! Canonical room state tree and the entities that live in it.
//!
//! One `RoomState` instance exists per active room and is mutated only by
//! the server's room state engine; clients hold a replicated view of it and
//! update that view exclusively through patches.

use crate::types::{
    footprints_overlap, occupied_cells, Footprint, GridPos, ItemCode, ItemInstanceId, RoomId,
    Rotation, SessionId, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Role of a connected actor, derived server-side from room ownership and
/// the room's guest policy. Never client-supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Owner,
    InteractiveGuest,
    ReadOnlyGuest,
}

/// Gameplay state of one grid cell.
///
/// A tile has at most one active timer. Readiness timestamps are always
/// computed server-side from catalog config plus the stored start time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TileEntity {
    #[default]
    Empty,
    Crop {
        item: ItemCode,
        planted_at_ms: u64,
        ready_at_ms: u64,
    },
    Incubator {
        item: ItemCode,
        hatch_start_ms: u64,
        hatch_duration_ms: u64,
    },
}

impl TileEntity {
    pub fn is_empty(&self) -> bool {
        matches!(self, TileEntity::Empty)
    }
}

/// A furniture instance. The instance id is stable across moves; an item is
/// either placed (present here) or unplaced (an inventory stack entry),
/// never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacedItem {
    pub instance: ItemInstanceId,
    pub owner: UserId,
    pub item: ItemCode,
    pub pos: GridPos,
    pub rotation: Rotation,
    pub footprint: Footprint,
}

/// Per-session presence of a connected player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerPresence {
    pub session: SessionId,
    pub user: UserId,
    pub role: Role,
    pub pos: GridPos,
    /// Highest accepted movement input sequence; older intents are stale.
    pub last_input_seq: u32,
}

/// Ephemeral visual event. Best-effort broadcast with a time-to-live,
/// outside the revision and durability model; safe to drop on restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientEffect {
    pub kind: EffectKind,
    pub pos: GridPos,
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectKind {
    Emote(String),
    HarvestBurst,
    HatchGlow,
}

/// Canonical state tree for one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub room_id: RoomId,
    pub owner: UserId,
    /// Strictly increasing; bumped by exactly 1 per accepted mutation.
    pub revision: u64,
    /// Advanced on the fixed server tick, not per mutation.
    pub server_time_ms: u64,
    pub grid_width: u32,
    pub grid_height: u32,
    /// Only non-empty tiles are stored; absent means `TileEntity::Empty`.
    pub tiles: HashMap<GridPos, TileEntity>,
    pub items: HashMap<ItemInstanceId, PlacedItem>,
    /// Unplaced item stacks per user, keyed by catalog code.
    pub inventories: HashMap<UserId, HashMap<ItemCode, u32>>,
    /// Materialized currency balances, mirrored from the economy ledger.
    pub wallets: HashMap<UserId, u64>,
    pub presences: HashMap<SessionId, PlayerPresence>,
    /// Per-room feature flag granting guests interactive permissions.
    pub guest_interaction_enabled: bool,
}

impl RoomState {
    pub fn new(room_id: RoomId, owner: UserId, grid_width: u32, grid_height: u32) -> Self {
        Self {
            room_id,
            owner,
            revision: 0,
            server_time_ms: 0,
            grid_width,
            grid_height,
            tiles: HashMap::new(),
            items: HashMap::new(),
            inventories: HashMap::new(),
            wallets: HashMap::new(),
            presences: HashMap::new(),
            guest_interaction_enabled: false,
        }
    }

    pub fn in_bounds(&self, pos: GridPos) -> bool {
        pos.x >= 0
            && pos.y >= 0
            && (pos.x as u32) < self.grid_width
            && (pos.y as u32) < self.grid_height
    }

    pub fn tile(&self, pos: GridPos) -> TileEntity {
        self.tiles.get(&pos).cloned().unwrap_or_default()
    }

    pub fn set_tile(&mut self, pos: GridPos, entity: TileEntity) {
        if entity.is_empty() {
            self.tiles.remove(&pos);
        } else {
            self.tiles.insert(pos, entity);
        }
    }

    /// Checks whether a footprint anchored at `pos` fits: fully in bounds
    /// and not overlapping any placed item other than `exclude`.
    pub fn placement_fits(
        &self,
        pos: GridPos,
        rotation: Rotation,
        footprint: Footprint,
        exclude: Option<ItemInstanceId>,
    ) -> PlacementCheck {
        for cell in occupied_cells(pos, rotation, footprint) {
            if !self.in_bounds(cell) {
                return PlacementCheck::OutOfBounds;
            }
        }
        for item in self.items.values() {
            if Some(item.instance) == exclude {
                continue;
            }
            if footprints_overlap(pos, rotation, footprint, item.pos, item.rotation, item.footprint)
            {
                return PlacementCheck::Overlaps(item.instance);
            }
        }
        PlacementCheck::Fits
    }

    pub fn inventory_count(&self, user: UserId, item: &str) -> u32 {
        self.inventories
            .get(&user)
            .and_then(|inv| inv.get(item))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_inventory_count(&mut self, user: UserId, item: ItemCode, count: u32) {
        let inv = self.inventories.entry(user).or_default();
        if count == 0 {
            inv.remove(&item);
        } else {
            inv.insert(item, count);
        }
    }

    pub fn wallet(&self, user: UserId) -> u64 {
        self.wallets.get(&user).copied().unwrap_or(0)
    }
}

/// Result of a placement collision check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementCheck {
    Fits,
    OutOfBounds,
    Overlaps(ItemInstanceId),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomState {
        RoomState::new(RoomId(1), UserId(10), 8, 8)
    }

    fn chair(instance: u64, x: i32, y: i32) -> PlacedItem {
        PlacedItem {
            instance: ItemInstanceId(instance),
            owner: UserId(10),
            item: "wooden_chair".to_string(),
            pos: GridPos::new(x, y),
            rotation: Rotation::R0,
            footprint: Footprint::new(2, 1),
        }
    }

    #[test]
    fn test_empty_tile_default() {
        let state = room();
        assert_eq!(state.tile(GridPos::new(3, 3)), TileEntity::Empty);
    }

    #[test]
    fn test_set_tile_removes_empty() {
        let mut state = room();
        let pos = GridPos::new(1, 1);
        state.set_tile(
            pos,
            TileEntity::Crop {
                item: "carrot_seed".to_string(),
                planted_at_ms: 0,
                ready_at_ms: 120_000,
            },
        );
        assert!(state.tiles.contains_key(&pos));
        state.set_tile(pos, TileEntity::Empty);
        assert!(!state.tiles.contains_key(&pos));
    }

    #[test]
    fn test_placement_out_of_bounds() {
        let state = room();
        let check =
            state.placement_fits(GridPos::new(7, 0), Rotation::R0, Footprint::new(2, 1), None);
        assert_eq!(check, PlacementCheck::OutOfBounds);
    }

    #[test]
    fn test_placement_overlap() {
        let mut state = room();
        let existing = chair(1, 2, 2);
        state.items.insert(existing.instance, existing);

        let check =
            state.placement_fits(GridPos::new(3, 2), Rotation::R0, Footprint::new(2, 1), None);
        assert_eq!(check, PlacementCheck::Overlaps(ItemInstanceId(1)));

        // Excluding the colliding instance (a move of the same item) fits.
        let check = state.placement_fits(
            GridPos::new(3, 2),
            Rotation::R0,
            Footprint::new(2, 1),
            Some(ItemInstanceId(1)),
        );
        assert_eq!(check, PlacementCheck::Fits);
    }

    #[test]
    fn test_inventory_counts() {
        let mut state = room();
        let user = UserId(10);
        assert_eq!(state.inventory_count(user, "carrot_seed"), 0);
        state.set_inventory_count(user, "carrot_seed".to_string(), 3);
        assert_eq!(state.inventory_count(user, "carrot_seed"), 3);
        state.set_inventory_count(user, "carrot_seed".to_string(), 0);
        assert!(!state.inventories[&user].contains_key("carrot_seed"));
    }
}
