//! Pending-action records: one per in-flight intent, tracking the
//! prediction applied locally, the exact pre-prediction state needed to
//! roll it back, and the retry/timeout schedule.

use rand::Rng;
use shared::{
    ActionId, ActionPayload, GridPos, ItemCode, ItemInstanceId, Patch, PlacedItem, PlayerPresence,
    TileEntity, UserId,
};
use std::time::{Duration, Instant};

/// First retransmit after this long without a result.
pub const RETRY_INITIAL: Duration = Duration::from_millis(500);
/// Transport retries reuse the same action id; after this many the intent
/// is handed to the hard-deadline rollback instead.
pub const MAX_RETRIES: u32 = 3;
/// Soft deadline: surface a "syncing" indication, keep the prediction.
pub const SOFT_DEADLINE: Duration = Duration::from_millis(500);
/// Hard deadline: roll the prediction back and park the record for a
/// possible late response.
pub const HARD_DEADLINE: Duration = Duration::from_secs(5);
/// Parked (timed-out) records are dropped entirely after this long.
pub const PARKED_TTL: Duration = Duration::from_secs(30);

/// The entity a non-pipeline-safe prediction takes an exclusive lock on.
/// A second intent against a locked entity is refused locally before it
/// is ever sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Tile(GridPos),
    Item(ItemInstanceId),
    SelfPresence,
}

/// Fine-grained key for the local version counters. Every authoritative
/// write bumps the counter of each key it touches; rollbacks and late
/// responses only restore or reconcile a key whose counter is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionKey {
    Tile(GridPos),
    Item(ItemInstanceId),
    Presence(shared::SessionId),
    Wallet(UserId),
    Inventory(UserId, ItemCode),
}

/// Exact pre-prediction values of everything a prediction touched.
/// Rollback restores these values; it never inverts live state, because
/// authoritative pushes may have rewritten it in the meantime.
#[derive(Debug, Clone, Default)]
pub struct EntitySnapshot {
    pub tile: Option<(GridPos, TileEntity)>,
    pub item: Option<(ItemInstanceId, Option<PlacedItem>)>,
    pub presence: Option<PlayerPresence>,
    pub wallet: Option<(UserId, u64)>,
    pub inventory: Vec<(UserId, ItemCode, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Sent, awaiting a result.
    Pending,
    /// Server confirmed; record kept only until markers are dropped.
    Acked,
    /// Server rejected; prediction rolled back.
    Nacked,
    /// Hard deadline passed; rolled back and parked awaiting a possible
    /// late response.
    TimedOut,
    /// A late response arrived and was safely applied.
    Reconciled,
    /// A late response arrived but local state had moved on; counted and
    /// dropped.
    Discarded,
}

#[derive(Debug, Clone)]
pub struct PendingAction {
    pub action_id: ActionId,
    pub payload: ActionPayload,
    pub base_revision: Option<u64>,
    pub entity_lock: Option<EntityKey>,
    pub base_snapshot: EntitySnapshot,
    pub predicted: Patch,
    pub retries: u32,
    pub sent_at: Instant,
    pub next_retry_at: Instant,
    pub soft_deadline: Instant,
    pub hard_deadline: Instant,
    pub status: PendingStatus,
    /// True once the soft-deadline "syncing" indication has been emitted.
    pub syncing_reported: bool,
    /// Versions of every touched key at prediction time; rollback restores
    /// only keys whose counter has not moved since.
    pub versions_at_predict: Vec<(VersionKey, u64)>,
    /// Versions at the moment of the timeout rollback; a late response
    /// only reconciles if all of them are still unchanged.
    pub versions_at_rollback: Vec<(VersionKey, u64)>,
    /// When the record was parked, for eventual purging.
    pub parked_at: Option<Instant>,
}

impl PendingAction {
    pub fn new(
        action_id: ActionId,
        payload: ActionPayload,
        base_revision: Option<u64>,
        entity_lock: Option<EntityKey>,
        base_snapshot: EntitySnapshot,
        predicted: Patch,
        now: Instant,
    ) -> Self {
        Self {
            action_id,
            payload,
            base_revision,
            entity_lock,
            base_snapshot,
            predicted,
            retries: 0,
            sent_at: now,
            next_retry_at: now + jittered(RETRY_INITIAL),
            soft_deadline: now + SOFT_DEADLINE,
            hard_deadline: now + HARD_DEADLINE,
            status: PendingStatus::Pending,
            syncing_reported: false,
            versions_at_predict: Vec::new(),
            versions_at_rollback: Vec::new(),
            parked_at: None,
        }
    }

    pub fn retry_due(&self, now: Instant) -> bool {
        self.status == PendingStatus::Pending && self.retries < MAX_RETRIES && now >= self.next_retry_at
    }

    /// Records a retransmit and schedules the next one with doubled,
    /// jittered backoff. The action id never changes across retries.
    pub fn record_retry(&mut self, now: Instant) {
        self.retries += 1;
        let backoff = RETRY_INITIAL * 2u32.pow(self.retries);
        self.next_retry_at = now + jittered(backoff);
    }
}

/// +/-50% jitter so a burst of timed-out intents does not retransmit in
/// lockstep.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(now: Instant) -> PendingAction {
        PendingAction::new(
            ActionId::generate(),
            ActionPayload::Emote {
                emote: "wave".to_string(),
            },
            None,
            None,
            EntitySnapshot::default(),
            Patch::new(0),
            now,
        )
    }

    #[test]
    fn test_retry_schedule_backs_off() {
        let now = Instant::now();
        let mut p = pending(now);
        assert!(!p.retry_due(now));
        assert!(p.retry_due(now + Duration::from_secs(1)));

        p.record_retry(now + Duration::from_secs(1));
        assert_eq!(p.retries, 1);
        // Second retry is at least the jitter floor of the doubled backoff
        // after the first.
        assert!(p.next_retry_at >= now + Duration::from_secs(1) + RETRY_INITIAL);
    }

    #[test]
    fn test_retry_stops_at_max() {
        let now = Instant::now();
        let mut p = pending(now);
        for i in 0..MAX_RETRIES {
            let t = now + Duration::from_secs(60 * (i as u64 + 1));
            assert!(p.retry_due(t));
            p.record_retry(t);
        }
        assert!(!p.retry_due(now + Duration::from_secs(600)));
    }

    #[test]
    fn test_deadlines_ordered() {
        let p = pending(Instant::now());
        assert!(p.soft_deadline < p.hard_deadline);
        assert_eq!(p.status, PendingStatus::Pending);
    }
}
