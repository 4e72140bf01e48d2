//! Identifier newtypes and grid geometry shared by client and server.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemInstanceId(pub u64);

/// Catalog key for an item definition. Prices, durations, and loot are
/// always looked up by this code on the server; clients never supply them.
pub type ItemCode = String;

/// Client-generated, retry-stable idempotency key for one user intent.
///
/// UUIDv7 is time-sortable, so action ids created later compare greater.
/// The same id is reused verbatim on every retry of the same intent so the
/// server can collapse duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub Uuid);

impl ActionId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Placement rotation, limited to quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Rotation {
    R0,
    R90,
    R180,
    R270,
}

/// Axis-aligned occupancy footprint of a furniture item, in grid cells,
/// measured at rotation `R0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Footprint {
    pub w: u32,
    pub h: u32,
}

impl Footprint {
    pub fn new(w: u32, h: u32) -> Self {
        Self { w, h }
    }

    /// Effective width/height after applying a rotation.
    pub fn rotated(&self, rotation: Rotation) -> (u32, u32) {
        match rotation {
            Rotation::R0 | Rotation::R180 => (self.w, self.h),
            Rotation::R90 | Rotation::R270 => (self.h, self.w),
        }
    }
}

/// Enumerates every grid cell covered by a footprint anchored at `pos`.
pub fn occupied_cells(pos: GridPos, rotation: Rotation, footprint: Footprint) -> Vec<GridPos> {
    let (w, h) = footprint.rotated(rotation);
    let mut cells = Vec::with_capacity((w * h) as usize);
    for dy in 0..h as i32 {
        for dx in 0..w as i32 {
            cells.push(GridPos::new(pos.x + dx, pos.y + dy));
        }
    }
    cells
}

/// True if two anchored footprints cover at least one common cell.
pub fn footprints_overlap(
    a_pos: GridPos,
    a_rot: Rotation,
    a_fp: Footprint,
    b_pos: GridPos,
    b_rot: Rotation,
    b_fp: Footprint,
) -> bool {
    let (aw, ah) = a_fp.rotated(a_rot);
    let (bw, bh) = b_fp.rotated(b_rot);
    let (ax2, ay2) = (a_pos.x + aw as i32, a_pos.y + ah as i32);
    let (bx2, by2) = (b_pos.x + bw as i32, b_pos.y + bh as i32);

    !(ax2 <= b_pos.x || bx2 <= a_pos.x || ay2 <= b_pos.y || by2 <= a_pos.y)
}
