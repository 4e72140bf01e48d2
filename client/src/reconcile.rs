//! Client reconciliation engine: optimistic prediction against the local
//! room view, rollback from base snapshots on rejection or timeout, and
//! convergence with the server's revisioned patch stream.
//!
//! The local view is only ever written two ways: a reversible predicted
//! patch recorded in a pending action, or an authoritative patch/snapshot
//! from the server. Rollback restores the recorded pre-prediction values;
//! it never inverts live state, and it skips any key the server has
//! rewritten since the prediction was made.

use crate::pending::{
    EntityKey, EntitySnapshot, PendingAction, PendingStatus, VersionKey, PARKED_TTL,
};
use log::{debug, info, warn};
use shared::{
    ActionId, ActionKind, ActionPayload, ActionRequest, Catalog, ItemCode, ItemDefKind, Patch,
    Recovery, Rejection, RoomState, SessionId, TileEntity, UserId,
};
use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;

/// Reasons an intent is refused locally, before it is ever sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("another action is already pending on this entity")]
    EntityLocked,
    #[error("unknown item code: {0}")]
    UnknownItem(ItemCode),
    #[error("no such entity to act on")]
    InvalidTarget,
    #[error("quantity out of range")]
    InvalidQuantity,
}

/// Events surfaced to the embedding client loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Retransmit this request verbatim (same action id).
    Retransmit(ActionRequest),
    /// Soft deadline passed; show a "syncing" indication, prediction stands.
    Syncing(ActionId),
    Confirmed(ActionId),
    Rejected(ActionId, Rejection),
    /// Hard deadline passed; the prediction has been rolled back.
    TimedOut(ActionId),
    /// A revision gap was detected; request a full snapshot.
    NeedResync,
}

pub struct Reconciler {
    session: SessionId,
    user: UserId,
    state: RoomState,
    catalog: Catalog,
    pending: HashMap<ActionId, PendingAction>,
    /// Bumped per key on every authoritative write.
    versions: HashMap<VersionKey, u64>,
    mismatches: u64,
    discarded_late: u64,
}

impl Reconciler {
    pub fn new(session: SessionId, user: UserId, snapshot: RoomState, catalog: Catalog) -> Self {
        Self {
            session,
            user,
            state: snapshot,
            catalog,
            pending: HashMap::new(),
            versions: HashMap::new(),
            mismatches: 0,
            discarded_late: 0,
        }
    }

    pub fn state(&self) -> &RoomState {
        &self.state
    }

    pub fn revision(&self) -> u64 {
        self.state.revision
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .values()
            .filter(|p| p.status == PendingStatus::Pending)
            .count()
    }

    /// Confirmed results whose authoritative patch differed from the
    /// prediction.
    pub fn mismatches(&self) -> u64 {
        self.mismatches
    }

    /// Late responses dropped because local state had moved on.
    pub fn discarded_late(&self) -> u64 {
        self.discarded_late
    }

    /// Predicts one intent, applies the reversible predicted patch to the
    /// local view, and returns the request to put on the wire. The action
    /// id is generated here once and reused verbatim on every retry.
    pub fn submit(
        &mut self,
        payload: ActionPayload,
        now: Instant,
    ) -> Result<ActionRequest, SubmitError> {
        let kind = payload.kind();
        let lock = lock_for(&payload);
        if !kind.is_pipeline_safe() {
            if let Some(key) = lock {
                let held = self.pending.values().any(|p| {
                    p.status == PendingStatus::Pending
                        && p.entity_lock == Some(key)
                        && !p.payload.kind().is_pipeline_safe()
                });
                if held {
                    return Err(SubmitError::EntityLocked);
                }
            }
        }

        let (base_snapshot, predicted) = self.predict(&payload)?;
        let base_revision = match kind {
            ActionKind::PlaceItem | ActionKind::MoveItem | ActionKind::PickUpItem => {
                Some(self.state.revision)
            }
            _ => None,
        };

        let action_id = ActionId::generate();
        predicted.apply_to(&mut self.state);
        let mut record = PendingAction::new(
            action_id,
            payload.clone(),
            base_revision,
            lock,
            base_snapshot,
            predicted,
            now,
        );
        record.versions_at_predict = self.versions_of(&record.base_snapshot);
        self.pending.insert(action_id, record);

        Ok(ActionRequest {
            action_id,
            base_revision,
            payload,
        })
    }

    /// Resolves a terminal result from the server, including a late one
    /// that arrives after the timeout rollback already ran.
    pub fn handle_result(
        &mut self,
        action_id: ActionId,
        result: Result<Patch, Rejection>,
        _now: Instant,
    ) -> Vec<ClientEvent> {
        let Some(mut record) = self.pending.remove(&action_id) else {
            debug!("result for unknown action {}", action_id);
            return Vec::new();
        };
        let mut events = Vec::new();

        match record.status {
            PendingStatus::Pending => match result {
                Ok(patch) => {
                    if patches_disagree(&record.predicted, &patch) {
                        self.mismatches += 1;
                        debug!("prediction mismatch for action {}", action_id);
                    }
                    record.status = PendingStatus::Acked;
                    events.extend(self.apply_authoritative(&patch));
                    events.push(ClientEvent::Confirmed(action_id));
                }
                Err(rejection) => {
                    record.status = PendingStatus::Nacked;
                    self.rollback(&record);
                    if rejection.recovery == Recovery::Resync {
                        events.push(ClientEvent::NeedResync);
                    }
                    events.push(ClientEvent::Rejected(action_id, rejection));
                }
            },

            // Parked after a timeout rollback: reconcile only if nothing
            // authoritative touched the same keys since the rollback, and
            // only if the patch itself is still adoptable (a full snapshot
            // taken meanwhile outruns it).
            PendingStatus::TimedOut => match result {
                Ok(patch) => {
                    let unchanged = record
                        .versions_at_rollback
                        .iter()
                        .all(|(key, v)| self.version(key) == *v);
                    let revision_before = self.state.revision;
                    if unchanged {
                        events.extend(self.apply_authoritative(&patch));
                    }
                    if unchanged && self.state.revision > revision_before {
                        record.status = PendingStatus::Reconciled;
                        events.push(ClientEvent::Confirmed(action_id));
                    } else {
                        record.status = PendingStatus::Discarded;
                        self.discarded_late += 1;
                        info!(
                            "late response for {} discarded: local state moved on",
                            action_id
                        );
                    }
                }
                // The rejection path already ran at timeout.
                Err(_) => {}
            },

            _ => {}
        }
        events
    }

    /// Applies a broadcast patch from another actor's accepted action.
    pub fn handle_push(&mut self, patch: &Patch) -> Vec<ClientEvent> {
        self.apply_authoritative(patch)
    }

    /// Replaces the local view with a full snapshot. In-flight predictions
    /// are parked; their results, if they ever arrive, are treated as late.
    pub fn handle_snapshot(&mut self, snapshot: RoomState, now: Instant) {
        info!("adopting full snapshot at revision {}", snapshot.revision);
        self.state = snapshot;
        self.versions.clear();
        for record in self.pending.values_mut() {
            if record.status == PendingStatus::Pending {
                record.status = PendingStatus::TimedOut;
                record.parked_at = Some(now);
                record.versions_at_rollback = record
                    .versions_at_predict
                    .iter()
                    .map(|(key, _)| (key.clone(), 0))
                    .collect();
            }
        }
    }

    /// Drives retries, the soft-deadline indication, the hard-deadline
    /// rollback, and parked-record expiry.
    pub fn tick(&mut self, now: Instant) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        let mut to_park = Vec::new();
        let mut to_drop = Vec::new();

        for (id, record) in &mut self.pending {
            match record.status {
                PendingStatus::Pending => {
                    if !record.syncing_reported && now >= record.soft_deadline {
                        record.syncing_reported = true;
                        events.push(ClientEvent::Syncing(*id));
                    }
                    if record.retry_due(now) {
                        record.record_retry(now);
                        events.push(ClientEvent::Retransmit(ActionRequest {
                            action_id: record.action_id,
                            base_revision: record.base_revision,
                            payload: record.payload.clone(),
                        }));
                    } else if now >= record.hard_deadline {
                        to_park.push(*id);
                    }
                }
                PendingStatus::TimedOut => {
                    let expired = record
                        .parked_at
                        .map(|t| now.duration_since(t) >= PARKED_TTL)
                        .unwrap_or(false);
                    if expired {
                        to_drop.push(*id);
                    }
                }
                _ => to_drop.push(*id),
            }
        }

        for id in to_park {
            if let Some(mut record) = self.pending.remove(&id) {
                warn!("action {} timed out; rolling back prediction", id);
                self.rollback(&record);
                record.status = PendingStatus::TimedOut;
                record.parked_at = Some(now);
                record.versions_at_rollback = record
                    .versions_at_predict
                    .iter()
                    .map(|(key, _)| (key.clone(), self.version(key)))
                    .collect();
                self.pending.insert(id, record);
                events.push(ClientEvent::TimedOut(id));
            }
        }
        for id in to_drop {
            self.pending.remove(&id);
        }
        events
    }

    /// Gap-checked application of an authoritative patch.
    fn apply_authoritative(&mut self, patch: &Patch) -> Vec<ClientEvent> {
        if patch.revision > self.state.revision + 1 {
            warn!(
                "revision gap: local {}, incoming {}",
                self.state.revision, patch.revision
            );
            return vec![ClientEvent::NeedResync];
        }
        if patch.revision <= self.state.revision {
            // Empty results (discarded stale movement, emotes) carry the
            // current revision; anything else below it is a duplicate.
            return Vec::new();
        }
        self.bump_versions(patch);
        patch.apply_to(&mut self.state);
        Vec::new()
    }

    fn bump_versions(&mut self, patch: &Patch) {
        let mut bump = |key: VersionKey| *self.versions.entry(key).or_insert(0) += 1;
        for (pos, _) in &patch.tiles {
            bump(VersionKey::Tile(*pos));
        }
        for item in &patch.items_upserted {
            bump(VersionKey::Item(item.instance));
        }
        for instance in &patch.items_removed {
            bump(VersionKey::Item(*instance));
        }
        for (user, code, _) in &patch.inventory {
            bump(VersionKey::Inventory(*user, code.clone()));
        }
        for (user, _) in &patch.wallets {
            bump(VersionKey::Wallet(*user));
        }
        for presence in &patch.presences_upserted {
            bump(VersionKey::Presence(presence.session));
        }
        for session in &patch.presences_removed {
            bump(VersionKey::Presence(*session));
        }
    }

    fn version(&self, key: &VersionKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    /// True if no authoritative write touched `key` since the versions in
    /// `at` were recorded.
    fn is_fresh(&self, key: &VersionKey, at: &[(VersionKey, u64)]) -> bool {
        at.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| self.version(key) == *v)
            .unwrap_or(true)
    }

    /// Restores the base snapshot, key by key, skipping keys the server
    /// has rewritten since the prediction.
    fn rollback(&mut self, record: &PendingAction) {
        let at = &record.versions_at_predict;
        if let Some((pos, tile)) = &record.base_snapshot.tile {
            if self.is_fresh(&VersionKey::Tile(*pos), at) {
                self.state.set_tile(*pos, tile.clone());
            }
        }
        if let Some((instance, prior)) = &record.base_snapshot.item {
            if self.is_fresh(&VersionKey::Item(*instance), at) {
                match prior {
                    Some(item) => {
                        self.state.items.insert(*instance, item.clone());
                    }
                    None => {
                        self.state.items.remove(instance);
                    }
                }
            }
        }
        if let Some(presence) = &record.base_snapshot.presence {
            if self.is_fresh(&VersionKey::Presence(presence.session), at) {
                self.state.presences.insert(presence.session, presence.clone());
            }
        }
        if let Some((user, balance)) = record.base_snapshot.wallet {
            if self.is_fresh(&VersionKey::Wallet(user), at) {
                self.state.wallets.insert(user, balance);
            }
        }
        for (user, code, count) in &record.base_snapshot.inventory {
            if self.is_fresh(&VersionKey::Inventory(*user, code.clone()), at) {
                self.state.set_inventory_count(*user, code.clone(), *count);
            }
        }
    }

    fn versions_of(&self, snapshot: &EntitySnapshot) -> Vec<(VersionKey, u64)> {
        let mut keys = Vec::new();
        if let Some((pos, _)) = &snapshot.tile {
            keys.push(VersionKey::Tile(*pos));
        }
        if let Some((instance, _)) = &snapshot.item {
            keys.push(VersionKey::Item(*instance));
        }
        if let Some(presence) = &snapshot.presence {
            keys.push(VersionKey::Presence(presence.session));
        }
        if let Some((user, _)) = &snapshot.wallet {
            keys.push(VersionKey::Wallet(*user));
        }
        for (user, code, _) in &snapshot.inventory {
            keys.push(VersionKey::Inventory(*user, code.clone()));
        }
        keys.into_iter()
            .map(|key| {
                let v = self.version(&key);
                (key, v)
            })
            .collect()
    }

    /// Builds the base snapshot and predicted patch for one intent,
    /// mirroring the server's validation semantics: consumption and
    /// rewards route to the room owner's stock, purchases to the buyer.
    fn predict(&self, payload: &ActionPayload) -> Result<(EntitySnapshot, Patch), SubmitError> {
        let mut snap = EntitySnapshot::default();
        // Predicted patches carry the current revision so applying them
        // never advances the confirmed revision.
        let mut patch = Patch::new(self.state.revision);
        let owner = self.state.owner;

        match payload {
            ActionPayload::MoveTo { pos, input_seq } => {
                if let Some(presence) = self.state.presences.get(&self.session) {
                    snap.presence = Some(presence.clone());
                    let mut updated = presence.clone();
                    updated.pos = *pos;
                    updated.last_input_seq = *input_seq;
                    patch.presences_upserted.push(updated);
                }
            }

            // Effects are transient; nothing to predict.
            ActionPayload::Emote { .. } => {}

            ActionPayload::PlantCrop { pos, seed } => {
                let def = self
                    .catalog
                    .get(seed)
                    .ok_or_else(|| SubmitError::UnknownItem(seed.clone()))?;
                let ItemDefKind::Seed { growth_ms, .. } = &def.kind else {
                    return Err(SubmitError::InvalidTarget);
                };
                snap.tile = Some((*pos, self.state.tile(*pos)));
                let count = self.state.inventory_count(owner, seed);
                snap.inventory.push((owner, seed.clone(), count));

                let planted = self.state.server_time_ms;
                patch.tiles.push((
                    *pos,
                    TileEntity::Crop {
                        item: seed.clone(),
                        planted_at_ms: planted,
                        ready_at_ms: planted + growth_ms,
                    },
                ));
                patch
                    .inventory
                    .push((owner, seed.clone(), count.saturating_sub(1)));
            }

            ActionPayload::HarvestCrop { pos } => {
                let tile = self.state.tile(*pos);
                let TileEntity::Crop { item, .. } = &tile else {
                    return Err(SubmitError::InvalidTarget);
                };
                let def = self
                    .catalog
                    .get(item)
                    .ok_or_else(|| SubmitError::UnknownItem(item.clone()))?;
                let ItemDefKind::Seed {
                    yield_coins,
                    yield_item,
                    ..
                } = &def.kind
                else {
                    return Err(SubmitError::InvalidTarget);
                };
                snap.tile = Some((*pos, tile.clone()));
                let balance = self.state.wallet(owner);
                snap.wallet = Some((owner, balance));

                patch.tiles.push((*pos, TileEntity::Empty));
                patch.wallets.push((owner, balance + yield_coins));
                if let Some((loot, amount)) = yield_item {
                    let count = self.state.inventory_count(owner, loot);
                    snap.inventory.push((owner, loot.clone(), count));
                    patch.inventory.push((owner, loot.clone(), count + amount));
                }
            }

            ActionPayload::StartIncubation { pos, egg } => {
                let def = self
                    .catalog
                    .get(egg)
                    .ok_or_else(|| SubmitError::UnknownItem(egg.clone()))?;
                let ItemDefKind::Egg { hatch_ms, .. } = &def.kind else {
                    return Err(SubmitError::InvalidTarget);
                };
                snap.tile = Some((*pos, self.state.tile(*pos)));
                let count = self.state.inventory_count(owner, egg);
                snap.inventory.push((owner, egg.clone(), count));

                patch.tiles.push((
                    *pos,
                    TileEntity::Incubator {
                        item: egg.clone(),
                        hatch_start_ms: self.state.server_time_ms,
                        hatch_duration_ms: *hatch_ms,
                    },
                ));
                patch
                    .inventory
                    .push((owner, egg.clone(), count.saturating_sub(1)));
            }

            ActionPayload::CollectHatch { pos } => {
                let tile = self.state.tile(*pos);
                let TileEntity::Incubator { item, .. } = &tile else {
                    return Err(SubmitError::InvalidTarget);
                };
                let def = self
                    .catalog
                    .get(item)
                    .ok_or_else(|| SubmitError::UnknownItem(item.clone()))?;
                let ItemDefKind::Egg { reward_item, .. } = &def.kind else {
                    return Err(SubmitError::InvalidTarget);
                };
                let (reward, amount) = reward_item;
                snap.tile = Some((*pos, tile.clone()));
                let count = self.state.inventory_count(owner, reward);
                snap.inventory.push((owner, reward.clone(), count));

                patch.tiles.push((*pos, TileEntity::Empty));
                patch.inventory.push((owner, reward.clone(), count + amount));
            }

            // The server assigns the instance id, so the placed item
            // itself only appears once the authoritative patch arrives;
            // the prediction covers the consumed inventory stack.
            ActionPayload::PlaceItem { item, .. } => {
                let def = self
                    .catalog
                    .get(item)
                    .ok_or_else(|| SubmitError::UnknownItem(item.clone()))?;
                if !matches!(def.kind, ItemDefKind::Furniture { .. }) {
                    return Err(SubmitError::InvalidTarget);
                }
                let count = self.state.inventory_count(owner, item);
                snap.inventory.push((owner, item.clone(), count));
                patch
                    .inventory
                    .push((owner, item.clone(), count.saturating_sub(1)));
            }

            ActionPayload::MoveItem {
                instance,
                pos,
                rotation,
            } => {
                let placed = self
                    .state
                    .items
                    .get(instance)
                    .ok_or(SubmitError::InvalidTarget)?;
                snap.item = Some((*instance, Some(placed.clone())));
                let mut moved = placed.clone();
                moved.pos = *pos;
                moved.rotation = *rotation;
                patch.items_upserted.push(moved);
            }

            ActionPayload::PickUpItem { instance } => {
                let placed = self
                    .state
                    .items
                    .get(instance)
                    .ok_or(SubmitError::InvalidTarget)?;
                snap.item = Some((*instance, Some(placed.clone())));
                let count = self.state.inventory_count(owner, &placed.item);
                snap.inventory.push((owner, placed.item.clone(), count));

                patch.items_removed.push(*instance);
                patch
                    .inventory
                    .push((owner, placed.item.clone(), count + 1));
            }

            ActionPayload::PurchaseItem { item, quantity } => {
                let def = self
                    .catalog
                    .get(item)
                    .ok_or_else(|| SubmitError::UnknownItem(item.clone()))?;
                let cost = def
                    .price
                    .checked_mul(*quantity as u64)
                    .ok_or(SubmitError::InvalidQuantity)?;
                let balance = self.state.wallet(self.user);
                snap.wallet = Some((self.user, balance));
                let count = self.state.inventory_count(self.user, item);
                snap.inventory.push((self.user, item.clone(), count));

                patch.wallets.push((self.user, balance.saturating_sub(cost)));
                patch
                    .inventory
                    .push((self.user, item.clone(), count + quantity));
            }
        }

        Ok((snap, patch))
    }
}

fn lock_for(payload: &ActionPayload) -> Option<EntityKey> {
    match payload {
        ActionPayload::MoveTo { .. } => Some(EntityKey::SelfPresence),
        ActionPayload::Emote { .. } | ActionPayload::PurchaseItem { .. } => None,
        ActionPayload::PlantCrop { pos, .. }
        | ActionPayload::HarvestCrop { pos }
        | ActionPayload::StartIncubation { pos, .. }
        | ActionPayload::CollectHatch { pos }
        | ActionPayload::PlaceItem { pos, .. } => Some(EntityKey::Tile(*pos)),
        ActionPayload::MoveItem { instance, .. } | ActionPayload::PickUpItem { instance } => {
            Some(EntityKey::Item(*instance))
        }
    }
}

/// Compares the keys present in both patches; a differing value means the
/// prediction was wrong (the authoritative value has already won).
fn patches_disagree(predicted: &Patch, authoritative: &Patch) -> bool {
    for (pos, tile) in &predicted.tiles {
        if let Some((_, auth)) = authoritative.tiles.iter().find(|(p, _)| p == pos) {
            if auth != tile {
                return true;
            }
        }
    }
    for (user, balance) in &predicted.wallets {
        if let Some((_, auth)) = authoritative.wallets.iter().find(|(u, _)| u == user) {
            if auth != balance {
                return true;
            }
        }
    }
    for (user, code, count) in &predicted.inventory {
        if let Some((_, _, auth)) = authoritative
            .inventory
            .iter()
            .find(|(u, c, _)| u == user && c == code)
        {
            if auth != count {
                return true;
            }
        }
    }
    false
}
