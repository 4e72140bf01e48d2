//! Authoritative room state engine: the single writer for one room.
//!
//! `submit` runs the whole pipeline as one logical unit: idempotency check,
//! permission resolution, validation, economy adjustment, entity mutation,
//! revision bump, idempotency commit, patch emission. A rejected transition
//! leaves state and revision untouched. The engine is owned by the server's
//! single-threaded event loop, so all mutations to a room are serialized by
//! construction.

use crate::checkpoint::PersistError;
use crate::economy::{EconomyError, EconomyLedger};
use crate::ledger::{IdempotencyLedger, TerminalResult};
use crate::permissions;
use crate::validate::{self, Transition};
use log::{debug, info};
use shared::{
    ActionId, ActionRequest, Catalog, EffectKind, GridPos, ItemCode, ItemInstanceId, Patch,
    PlacedItem, PlayerPresence, RejectCode, Rejection, Role, RoomState, SessionId, TileEntity,
    TransientEffect, UserId,
};

const HARVEST_EFFECT_TTL_MS: u64 = 1_500;
const HATCH_EFFECT_TTL_MS: u64 = 2_500;

/// Result of one submitted intent.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    pub action_id: ActionId,
    pub result: TerminalResult,
    /// True if this was an idempotency hit: the recorded terminal result
    /// was returned and nothing was reprocessed.
    pub duplicate: bool,
    pub effect: Option<TransientEffect>,
}

impl SubmitOutcome {
    /// The patch to fan out to room subscribers, if the action mutated
    /// state and is not a replayed duplicate.
    pub fn broadcast_patch(&self) -> Option<&Patch> {
        if self.duplicate {
            return None;
        }
        match &self.result {
            Ok(patch) if !patch.is_empty() => Some(patch),
            _ => None,
        }
    }
}

pub struct RoomEngine<E: EconomyLedger> {
    state: RoomState,
    ledger: IdempotencyLedger,
    economy: E,
    catalog: Catalog,
    next_instance_id: u64,
}

impl<E: EconomyLedger + Clone> RoomEngine<E> {
    /// Builds an engine around a fresh state tree at revision 0.
    pub fn new(state: RoomState, economy: E, catalog: Catalog) -> Self {
        Self::recover(state, IdempotencyLedger::new(), economy, catalog)
    }

    /// Rebuilds an engine from the last durable checkpoint. The recovered
    /// idempotency ledger keeps at-most-once across the restart: a
    /// retransmit of an action that was flushed before the crash replays
    /// its recorded result. Stale presences from before the restart are
    /// dropped; sessions rejoin.
    pub fn recover(
        mut state: RoomState,
        ledger: IdempotencyLedger,
        economy: E,
        catalog: Catalog,
    ) -> Self {
        state.presences.clear();
        let next_instance_id = state
            .items
            .keys()
            .map(|id| id.0 + 1)
            .max()
            .unwrap_or(1);
        Self {
            state,
            ledger,
            economy,
            catalog,
            next_instance_id,
        }
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn economy(&self) -> &E {
        &self.economy
    }

    pub fn idempotency(&self) -> &IdempotencyLedger {
        &self.ledger
    }

    /// Point-in-time copy used for join snapshots and full resyncs.
    pub fn snapshot(&self) -> RoomState {
        self.state.clone()
    }

    /// Advances the room clock. Runs on the fixed server tick, never on
    /// mutation.
    pub fn tick(&mut self, now_ms: u64) {
        self.state.server_time_ms = now_ms;
    }

    pub fn sweep_idempotency(&mut self, now_ms: u64) {
        let removed = self.ledger.sweep(now_ms);
        if removed > 0 {
            debug!(
                "idempotency sweep: room={} reclaimed={}",
                self.state.room_id.0, removed
            );
        }
    }

    /// Initial grant for a brand-new room (no prior checkpoint).
    pub fn bootstrap_owner(&mut self, coins: u64, items: &[(ItemCode, u32)]) {
        let owner = self.state.owner;
        let (balance, _) = self.economy.credit(owner, coins, "initial grant", None);
        self.state.wallets.insert(owner, balance);
        for (item, count) in items {
            let current = self.state.inventory_count(owner, item);
            self.state
                .set_inventory_count(owner, item.clone(), current + count);
        }
    }

    /// Adds a presence for a joining session. Presence changes are part of
    /// the revisioned state tree, so joins emit a patch like any mutation.
    pub fn join(&mut self, session: SessionId, user: UserId) -> (Role, Patch) {
        let role = permissions::resolve(user, &self.state);
        let presence = PlayerPresence {
            session,
            user,
            role,
            pos: GridPos::new(0, 0),
            last_input_seq: 0,
        };
        self.state.presences.insert(session, presence.clone());
        self.state.revision += 1;
        let mut patch = Patch::new(self.state.revision);
        patch.presences_upserted.push(presence);
        info!(
            "session {} joined room {} as {:?} (user {})",
            session.0, self.state.room_id.0, role, user.0
        );
        (role, patch)
    }

    pub fn leave(&mut self, session: SessionId) -> Option<Patch> {
        self.state.presences.remove(&session)?;
        self.state.revision += 1;
        let mut patch = Patch::new(self.state.revision);
        patch.presences_removed.push(session);
        info!(
            "session {} left room {}",
            session.0, self.state.room_id.0
        );
        Some(patch)
    }

    /// Submits one client intent and resolves it to a terminal result.
    ///
    /// `degraded` gates economic kinds while persistence is failing.
    /// `critical_flush` is invoked, still inside this serialized step, for
    /// kinds whose success must be durable before it is acknowledged; if
    /// the flush fails the mutation is rolled back and the intent resolves
    /// to `PersistenceDegraded`.
    pub fn submit<F>(
        &mut self,
        session: SessionId,
        actor: UserId,
        request: &ActionRequest,
        now_ms: u64,
        degraded: bool,
        critical_flush: F,
    ) -> SubmitOutcome
    where
        F: FnOnce(&RoomState, &IdempotencyLedger) -> Result<(), PersistError>,
    {
        let action_id = request.action_id;
        let kind = request.payload.kind();

        // Dedupe before any mutation begins.
        if let Some(result) = self.ledger.check(actor, action_id, now_ms) {
            debug!(
                "duplicate action {} from user {} replayed from ledger",
                action_id, actor.0
            );
            return SubmitOutcome {
                action_id,
                result: result.clone(),
                duplicate: true,
                effect: None,
            };
        }

        if degraded && kind.is_economic() {
            return self.resolve(
                actor,
                request,
                now_ms,
                Err(Rejection::new(RejectCode::PersistenceDegraded)),
                None,
            );
        }

        let role = permissions::resolve(actor, &self.state);
        if !permissions::is_allowed(role, kind) {
            permissions::log_denial(actor, kind, &self.state);
            return self.resolve(
                actor,
                request,
                now_ms,
                Err(Rejection::new(RejectCode::PermissionDenied)),
                None,
            );
        }

        let transition = match validate::validate(
            &self.state,
            session,
            actor,
            request,
            &self.catalog,
            now_ms,
        ) {
            Ok(transition) => transition,
            Err(rejection) => return self.resolve(actor, request, now_ms, Err(rejection), None),
        };

        // Non-mutating transitions resolve at the current revision without
        // consuming one.
        match &transition {
            Transition::Noop => {
                let patch = Patch::new(self.state.revision);
                return self.resolve(actor, request, now_ms, Ok(patch), None);
            }
            Transition::Emote { effect } => {
                let patch = Patch::new(self.state.revision);
                let effect = effect.clone();
                return self.resolve(actor, request, now_ms, Ok(patch), Some(effect));
            }
            _ => {}
        }

        // Mutating path. Critical kinds keep a pre-mutation snapshot so a
        // failed durable write can roll the whole step back.
        let rollback = if kind.is_critical() {
            Some((self.state.clone(), self.economy.clone()))
        } else {
            None
        };

        let (mut result, effect) = match self.apply(transition, action_id) {
            Ok((patch, effect)) => (Ok(patch), effect),
            Err(rejection) => (Err(rejection), None),
        };

        if result.is_ok() && kind.is_critical() {
            // Record the result before the durable write so the checkpoint
            // blob covers this action; a retransmit after a crash-restart
            // then replays it instead of reprocessing.
            self.ledger
                .commit(actor, action_id, kind, result.clone(), now_ms);
            if let Err(e) = critical_flush(&self.state, &self.ledger) {
                let (state, economy) = rollback.expect("critical kinds snapshot before applying");
                info!(
                    "critical flush failed, rolling back action {}: {}",
                    action_id, e
                );
                self.state = state;
                self.economy = economy;
                result = Err(Rejection::new(RejectCode::PersistenceDegraded));
            }
        }

        let effect = if result.is_ok() { effect } else { None };
        self.resolve(actor, request, now_ms, result, effect)
    }

    /// Records the terminal result in the idempotency ledger, in the same
    /// serialized step as the mutation it guards.
    fn resolve(
        &mut self,
        actor: UserId,
        request: &ActionRequest,
        now_ms: u64,
        result: TerminalResult,
        effect: Option<TransientEffect>,
    ) -> SubmitOutcome {
        self.ledger.commit(
            actor,
            request.action_id,
            request.payload.kind(),
            result.clone(),
            now_ms,
        );
        SubmitOutcome {
            action_id: request.action_id,
            result,
            duplicate: false,
            effect,
        }
    }

    /// Applies a validated transition: economy first (the only fallible
    /// sub-step), then entity mutation, then the revision bump. Everything
    /// lands in one patch describing only the changed sub-trees.
    fn apply(
        &mut self,
        transition: Transition,
        action_id: ActionId,
    ) -> Result<(Patch, Option<TransientEffect>), Rejection> {
        let mut patch = Patch::new(self.state.revision + 1);
        let mut effect = None;

        match transition {
            Transition::Noop | Transition::Emote { .. } => unreachable!("handled before apply"),

            Transition::MovePresence {
                session,
                pos,
                input_seq,
            } => {
                let presence = self
                    .state
                    .presences
                    .get_mut(&session)
                    .ok_or_else(|| Rejection::new(RejectCode::InvalidTarget))?;
                presence.pos = pos;
                presence.last_input_seq = input_seq;
                patch.presences_upserted.push(presence.clone());
            }

            Transition::Plant {
                pos,
                seed,
                planted_at_ms,
                ready_at_ms,
                stock_user,
            } => {
                let count = self.state.inventory_count(stock_user, &seed) - 1;
                self.state
                    .set_inventory_count(stock_user, seed.clone(), count);
                let tile = TileEntity::Crop {
                    item: seed.clone(),
                    planted_at_ms,
                    ready_at_ms,
                };
                self.state.set_tile(pos, tile.clone());
                patch.inventory.push((stock_user, seed, count));
                patch.tiles.push((pos, tile));
            }

            Transition::Harvest {
                pos,
                coins,
                item_loot,
                benefit_user,
            } => {
                let (balance, _) =
                    self.economy
                        .credit(benefit_user, coins, "harvest", Some(action_id));
                self.state.wallets.insert(benefit_user, balance);
                patch.wallets.push((benefit_user, balance));
                if let Some((item, amount)) = item_loot {
                    let count = self.state.inventory_count(benefit_user, &item) + amount;
                    self.state
                        .set_inventory_count(benefit_user, item.clone(), count);
                    patch.inventory.push((benefit_user, item, count));
                }
                self.state.set_tile(pos, TileEntity::Empty);
                patch.tiles.push((pos, TileEntity::Empty));
                effect = Some(TransientEffect {
                    kind: EffectKind::HarvestBurst,
                    pos,
                    ttl_ms: HARVEST_EFFECT_TTL_MS,
                });
            }

            Transition::StartHatch {
                pos,
                egg,
                hatch_start_ms,
                hatch_duration_ms,
                stock_user,
            } => {
                let count = self.state.inventory_count(stock_user, &egg) - 1;
                self.state.set_inventory_count(stock_user, egg.clone(), count);
                let tile = TileEntity::Incubator {
                    item: egg.clone(),
                    hatch_start_ms,
                    hatch_duration_ms,
                };
                self.state.set_tile(pos, tile.clone());
                patch.inventory.push((stock_user, egg, count));
                patch.tiles.push((pos, tile));
            }

            Transition::CollectHatch {
                pos,
                reward: (item, amount),
                benefit_user,
            } => {
                let count = self.state.inventory_count(benefit_user, &item) + amount;
                self.state
                    .set_inventory_count(benefit_user, item.clone(), count);
                patch.inventory.push((benefit_user, item, count));
                self.state.set_tile(pos, TileEntity::Empty);
                patch.tiles.push((pos, TileEntity::Empty));
                effect = Some(TransientEffect {
                    kind: EffectKind::HatchGlow,
                    pos,
                    ttl_ms: HATCH_EFFECT_TTL_MS,
                });
            }

            Transition::Place {
                stock_user,
                item,
                pos,
                rotation,
                footprint,
            } => {
                let count = self.state.inventory_count(stock_user, &item) - 1;
                self.state
                    .set_inventory_count(stock_user, item.clone(), count);
                let instance = ItemInstanceId(self.next_instance_id);
                self.next_instance_id += 1;
                let placed = PlacedItem {
                    instance,
                    owner: stock_user,
                    item: item.clone(),
                    pos,
                    rotation,
                    footprint,
                };
                self.state.items.insert(instance, placed.clone());
                patch.inventory.push((stock_user, item, count));
                patch.items_upserted.push(placed);
            }

            Transition::MoveItem {
                instance,
                pos,
                rotation,
            } => {
                let item = self
                    .state
                    .items
                    .get_mut(&instance)
                    .ok_or_else(|| Rejection::new(RejectCode::InvalidTarget))?;
                item.pos = pos;
                item.rotation = rotation;
                patch.items_upserted.push(item.clone());
            }

            Transition::PickUp {
                instance,
                stock_user,
            } => {
                let item = self
                    .state
                    .items
                    .remove(&instance)
                    .ok_or_else(|| Rejection::new(RejectCode::InvalidTarget))?;
                let count = self.state.inventory_count(stock_user, &item.item) + 1;
                self.state
                    .set_inventory_count(stock_user, item.item.clone(), count);
                patch.items_removed.push(instance);
                patch.inventory.push((stock_user, item.item, count));
            }

            Transition::Purchase {
                buyer,
                item,
                quantity,
                cost,
            } => {
                // The economy ledger is the authority on funds; the
                // validator's wallet check was only a mirror read.
                let (balance, _) = self
                    .economy
                    .debit(buyer, cost, "purchase", Some(action_id))
                    .map_err(|EconomyError::Insufficient { needed, available }| {
                        Rejection::new(RejectCode::InsufficientFunds { needed, available })
                    })?;
                self.state.wallets.insert(buyer, balance);
                let count = self.state.inventory_count(buyer, &item) + quantity;
                self.state
                    .set_inventory_count(buyer, item.clone(), count);
                patch.wallets.push((buyer, balance));
                patch.inventory.push((buyer, item, count));
            }
        }

        self.state.revision += 1;
        debug_assert_eq!(self.state.revision, patch.revision);
        Ok((patch, effect))
    }
}
