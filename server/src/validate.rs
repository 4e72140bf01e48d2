//! Action validation: pure reads of the canonical state that turn a client
//! intent into a ready-to-apply transition or a structured rejection.
//!
//! Nothing client-asserted is trusted here. Readiness, collision, cost, and
//! ownership are recomputed from the catalog and the entities' own stored
//! timestamps. Optimistic-concurrency kinds carry a client-observed base
//! revision that is checked as an explicit compare-and-swap.

use shared::{
    ActionPayload, ActionRequest, Catalog, EffectKind, Footprint, GridPos, ItemCode, ItemDefKind,
    ItemInstanceId, PlacementCheck, RejectCode, Rejection, RoomState, Rotation, SessionId,
    TileEntity, TransientEffect, UserId,
};

pub const EMOTE_TTL_MS: u64 = 3_000;

/// A validated state transition, carrying every server-computed value the
/// engine needs to apply it. `stock_user` / `benefit_user` route inventory
/// consumption and rewards (always the room owner for room-scoped economy,
/// so interactive-guest help benefits the host).
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Accepted but mutates nothing (stale movement input).
    Noop,
    MovePresence {
        session: SessionId,
        pos: GridPos,
        input_seq: u32,
    },
    Emote {
        effect: TransientEffect,
    },
    Plant {
        pos: GridPos,
        seed: ItemCode,
        planted_at_ms: u64,
        ready_at_ms: u64,
        stock_user: UserId,
    },
    Harvest {
        pos: GridPos,
        coins: u64,
        item_loot: Option<(ItemCode, u32)>,
        benefit_user: UserId,
    },
    StartHatch {
        pos: GridPos,
        egg: ItemCode,
        hatch_start_ms: u64,
        hatch_duration_ms: u64,
        stock_user: UserId,
    },
    CollectHatch {
        pos: GridPos,
        reward: (ItemCode, u32),
        benefit_user: UserId,
    },
    Place {
        stock_user: UserId,
        item: ItemCode,
        pos: GridPos,
        rotation: Rotation,
        footprint: Footprint,
    },
    MoveItem {
        instance: ItemInstanceId,
        pos: GridPos,
        rotation: Rotation,
    },
    PickUp {
        instance: ItemInstanceId,
        stock_user: UserId,
    },
    Purchase {
        buyer: UserId,
        item: ItemCode,
        quantity: u32,
        cost: u64,
    },
}

fn reject(code: RejectCode) -> Result<Transition, Rejection> {
    Err(Rejection::new(code))
}

/// Compare-and-swap on the client-observed base revision, used by the
/// placement kinds.
fn check_base_revision(state: &RoomState, base: Option<u64>) -> Result<(), Rejection> {
    match base {
        Some(base) if base != state.revision => Err(Rejection::new(RejectCode::StaleRevision {
            current: state.revision,
        })),
        _ => Ok(()),
    }
}

fn item_ownership(state: &RoomState, actor: UserId, instance: ItemInstanceId) -> Result<(), Rejection> {
    let item = state
        .items
        .get(&instance)
        .ok_or_else(|| Rejection::new(RejectCode::InvalidTarget))?;
    if item.owner != actor && state.owner != actor {
        return Err(Rejection::new(RejectCode::NotOwned));
    }
    Ok(())
}

pub fn validate(
    state: &RoomState,
    session: SessionId,
    actor: UserId,
    request: &ActionRequest,
    catalog: &Catalog,
    now_ms: u64,
) -> Result<Transition, Rejection> {
    match &request.payload {
        ActionPayload::MoveTo { pos, input_seq } => {
            if !state.in_bounds(*pos) {
                return reject(RejectCode::InvalidTarget);
            }
            // Out-of-order movement is discarded, not rejected: the newer
            // accepted input already supersedes it.
            if let Some(presence) = state.presences.get(&session) {
                if *input_seq <= presence.last_input_seq {
                    return Ok(Transition::Noop);
                }
            }
            Ok(Transition::MovePresence {
                session,
                pos: *pos,
                input_seq: *input_seq,
            })
        }

        ActionPayload::Emote { emote } => {
            let pos = state
                .presences
                .get(&session)
                .map(|p| p.pos)
                .unwrap_or(GridPos::new(0, 0));
            Ok(Transition::Emote {
                effect: TransientEffect {
                    kind: EffectKind::Emote(emote.clone()),
                    pos,
                    ttl_ms: EMOTE_TTL_MS,
                },
            })
        }

        ActionPayload::PlantCrop { pos, seed } => {
            if !state.in_bounds(*pos) {
                return reject(RejectCode::InvalidTarget);
            }
            if !state.tile(*pos).is_empty() {
                return reject(RejectCode::Occupied);
            }
            let def = match catalog.get(seed) {
                Some(def) => def,
                None => return reject(RejectCode::UnknownItem),
            };
            let growth_ms = match &def.kind {
                ItemDefKind::Seed { growth_ms, .. } => *growth_ms,
                _ => return reject(RejectCode::InvalidTarget),
            };
            let stock_user = state.owner;
            if state.inventory_count(stock_user, seed) == 0 {
                return reject(RejectCode::OutOfStock);
            }
            Ok(Transition::Plant {
                pos: *pos,
                seed: seed.clone(),
                planted_at_ms: now_ms,
                ready_at_ms: now_ms + growth_ms,
                stock_user,
            })
        }

        ActionPayload::HarvestCrop { pos } => {
            let (item, ready_at_ms) = match state.tile(*pos) {
                TileEntity::Crop {
                    item, ready_at_ms, ..
                } => (item, ready_at_ms),
                _ => return reject(RejectCode::InvalidTarget),
            };
            if now_ms < ready_at_ms {
                return reject(RejectCode::NotReady { ready_at_ms });
            }
            let (coins, item_loot) = match catalog.get(&item).map(|def| &def.kind) {
                Some(ItemDefKind::Seed {
                    yield_coins,
                    yield_item,
                    ..
                }) => (*yield_coins, yield_item.clone()),
                _ => return reject(RejectCode::UnknownItem),
            };
            Ok(Transition::Harvest {
                pos: *pos,
                coins,
                item_loot,
                benefit_user: state.owner,
            })
        }

        ActionPayload::StartIncubation { pos, egg } => {
            if !state.in_bounds(*pos) {
                return reject(RejectCode::InvalidTarget);
            }
            if !state.tile(*pos).is_empty() {
                return reject(RejectCode::Occupied);
            }
            let hatch_ms = match catalog.get(egg).map(|def| &def.kind) {
                Some(ItemDefKind::Egg { hatch_ms, .. }) => *hatch_ms,
                Some(_) => return reject(RejectCode::InvalidTarget),
                None => return reject(RejectCode::UnknownItem),
            };
            let stock_user = state.owner;
            if state.inventory_count(stock_user, egg) == 0 {
                return reject(RejectCode::OutOfStock);
            }
            // Stamped from the submit-time clock, the same clock readiness
            // is later checked against (the tick clock is coarser).
            Ok(Transition::StartHatch {
                pos: *pos,
                egg: egg.clone(),
                hatch_start_ms: now_ms,
                hatch_duration_ms: hatch_ms,
                stock_user,
            })
        }

        ActionPayload::CollectHatch { pos } => {
            let (item, hatch_start_ms, hatch_duration_ms) = match state.tile(*pos) {
                TileEntity::Incubator {
                    item,
                    hatch_start_ms,
                    hatch_duration_ms,
                } => (item, hatch_start_ms, hatch_duration_ms),
                _ => return reject(RejectCode::InvalidTarget),
            };
            let ready_at_ms = hatch_start_ms + hatch_duration_ms;
            if now_ms < ready_at_ms {
                return reject(RejectCode::NotReady { ready_at_ms });
            }
            let reward = match catalog.get(&item).map(|def| &def.kind) {
                Some(ItemDefKind::Egg { reward_item, .. }) => reward_item.clone(),
                _ => return reject(RejectCode::UnknownItem),
            };
            Ok(Transition::CollectHatch {
                pos: *pos,
                reward,
                benefit_user: state.owner,
            })
        }

        ActionPayload::PlaceItem {
            item,
            pos,
            rotation,
        } => {
            check_base_revision(state, request.base_revision)?;
            let footprint = match catalog.get(item).map(|def| &def.kind) {
                Some(ItemDefKind::Furniture { footprint }) => *footprint,
                Some(_) => return reject(RejectCode::InvalidTarget),
                None => return reject(RejectCode::UnknownItem),
            };
            let stock_user = state.owner;
            if state.inventory_count(stock_user, item) == 0 {
                return reject(RejectCode::OutOfStock);
            }
            match state.placement_fits(*pos, *rotation, footprint, None) {
                PlacementCheck::Fits => {}
                PlacementCheck::OutOfBounds => return reject(RejectCode::InvalidTarget),
                PlacementCheck::Overlaps(_) => return reject(RejectCode::Occupied),
            }
            Ok(Transition::Place {
                stock_user,
                item: item.clone(),
                pos: *pos,
                rotation: *rotation,
                footprint,
            })
        }

        ActionPayload::MoveItem {
            instance,
            pos,
            rotation,
        } => {
            check_base_revision(state, request.base_revision)?;
            item_ownership(state, actor, *instance)?;
            let footprint = state.items[instance].footprint;
            match state.placement_fits(*pos, *rotation, footprint, Some(*instance)) {
                PlacementCheck::Fits => {}
                PlacementCheck::OutOfBounds => return reject(RejectCode::InvalidTarget),
                PlacementCheck::Overlaps(_) => return reject(RejectCode::Occupied),
            }
            Ok(Transition::MoveItem {
                instance: *instance,
                pos: *pos,
                rotation: *rotation,
            })
        }

        ActionPayload::PickUpItem { instance } => {
            check_base_revision(state, request.base_revision)?;
            item_ownership(state, actor, *instance)?;
            let stock_user = state.items[instance].owner;
            Ok(Transition::PickUp {
                instance: *instance,
                stock_user,
            })
        }

        ActionPayload::PurchaseItem { item, quantity } => {
            if *quantity == 0 {
                return reject(RejectCode::InvalidTarget);
            }
            let def = match catalog.get(item) {
                Some(def) => def,
                None => return reject(RejectCode::UnknownItem),
            };
            if def.price == 0 {
                // Not for sale.
                return reject(RejectCode::InvalidTarget);
            }
            // Total cost must not wrap; an overflowing quantity is a
            // malformed request.
            let cost = match def.price.checked_mul(*quantity as u64) {
                Some(cost) => cost,
                None => return reject(RejectCode::InvalidTarget),
            };
            let available = state.wallet(actor);
            if available < cost {
                return reject(RejectCode::InsufficientFunds {
                    needed: cost,
                    available,
                });
            }
            Ok(Transition::Purchase {
                buyer: actor,
                item: item.clone(),
                quantity: *quantity,
                cost,
            })
        }
    }
}
