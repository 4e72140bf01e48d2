//! Idempotency ledger: `(actor, actionId)` -> terminal result, with
//! kind-specific retention windows.
//!
//! `check` runs before any mutation begins; `commit` happens inside the
//! same serialized apply step as the mutation it guards, so no window
//! exists where a duplicate could race a not-yet-recorded action. Once a
//! terminal result is recorded, every later delivery of the same action id
//! from the same actor returns that exact result and performs no further
//! mutation.
//!
//! The ledger is serialized into the durable checkpoint alongside the room
//! state, so dedupe holds across a crash-restart: a retransmit of an
//! action whose flush committed before the crash replays the recorded
//! result instead of reprocessing.

use serde::{Deserialize, Serialize};
use shared::{ActionId, ActionKind, Patch, Rejection, RetentionClass, UserId};
use std::collections::HashMap;

/// Retention must strictly exceed the maximum client retry horizon
/// (3 retries with capped backoff, well under a minute).
const RETENTION_REWARD_MS: u64 = 24 * 60 * 60 * 1000;
const RETENTION_CONSUME_MS: u64 = 10 * 60 * 1000;
const RETENTION_SHORT_MS: u64 = 30 * 1000;

pub type TerminalResult = Result<Patch, Rejection>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    result: TerminalResult,
    expires_at_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IdempotencyLedger {
    records: HashMap<(UserId, ActionId), Record>,
}

impl IdempotencyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retention_ms(kind: ActionKind) -> u64 {
        match kind.retention_class() {
            RetentionClass::Reward => RETENTION_REWARD_MS,
            RetentionClass::Consume => RETENTION_CONSUME_MS,
            RetentionClass::Short => RETENTION_SHORT_MS,
        }
    }

    /// Returns the recorded terminal result for a duplicate delivery, if
    /// any. Expired records are treated as absent (and reclaimed lazily).
    pub fn check(&self, actor: UserId, action_id: ActionId, now_ms: u64) -> Option<&TerminalResult> {
        self.records
            .get(&(actor, action_id))
            .filter(|record| record.expires_at_ms > now_ms)
            .map(|record| &record.result)
    }

    /// Records the terminal result for an action id with the kind's
    /// retention window.
    pub fn commit(
        &mut self,
        actor: UserId,
        action_id: ActionId,
        kind: ActionKind,
        result: TerminalResult,
        now_ms: u64,
    ) {
        let expires_at_ms = now_ms + Self::retention_ms(kind);
        self.records.insert(
            (actor, action_id),
            Record {
                result,
                expires_at_ms,
            },
        );
    }

    /// Reclaims expired records. Returns how many were removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.expires_at_ms > now_ms);
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Patch, RejectCode, Rejection};

    fn actor() -> UserId {
        UserId(10)
    }

    #[test]
    fn test_miss_then_hit() {
        let mut ledger = IdempotencyLedger::new();
        let id = ActionId::generate();
        assert!(ledger.check(actor(), id, 0).is_none());

        ledger.commit(actor(), id, ActionKind::HarvestCrop, Ok(Patch::new(4)), 0);

        let hit = ledger.check(actor(), id, 1_000).unwrap();
        assert_eq!(hit.as_ref().unwrap().revision, 4);
    }

    #[test]
    fn test_rejections_are_terminal_too() {
        let mut ledger = IdempotencyLedger::new();
        let id = ActionId::generate();
        ledger.commit(
            actor(),
            id,
            ActionKind::PurchaseItem,
            Err(Rejection::new(RejectCode::InsufficientFunds {
                needed: 30,
                available: 10,
            })),
            0,
        );
        assert!(ledger.check(actor(), id, 0).unwrap().is_err());
    }

    #[test]
    fn test_actor_scoping() {
        let mut ledger = IdempotencyLedger::new();
        let id = ActionId::generate();
        ledger.commit(actor(), id, ActionKind::PlantCrop, Ok(Patch::new(1)), 0);
        assert!(ledger.check(UserId(99), id, 0).is_none());
    }

    #[test]
    fn test_retention_windows_by_class() {
        assert_eq!(
            IdempotencyLedger::retention_ms(ActionKind::HarvestCrop),
            24 * 60 * 60 * 1000
        );
        assert_eq!(
            IdempotencyLedger::retention_ms(ActionKind::PlantCrop),
            10 * 60 * 1000
        );
        assert_eq!(IdempotencyLedger::retention_ms(ActionKind::MoveTo), 30_000);
    }

    #[test]
    fn test_expiry_and_sweep() {
        let mut ledger = IdempotencyLedger::new();
        let id = ActionId::generate();
        ledger.commit(actor(), id, ActionKind::MoveTo, Ok(Patch::new(1)), 0);

        // Still visible inside the retention window.
        assert!(ledger.check(actor(), id, 29_999).is_some());
        // Treated as absent once expired, even before the sweep runs.
        assert!(ledger.check(actor(), id, 30_001).is_none());

        assert_eq!(ledger.sweep(30_001), 1);
        assert!(ledger.is_empty());
    }
}
