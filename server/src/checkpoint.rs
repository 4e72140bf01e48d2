//! Asynchronous persistence checkpointing with bounded economic risk.
//!
//! The checkpointer flushes dirty room state to a durable store on four
//! triggers: a short debounce while dirty, immediately for critical
//! economic mutations (the causing response is held until the write
//! commits), on lifecycle events (owner-disconnect eviction, shutdown),
//! and a longer periodic safety interval. While the store is failing the
//! room keeps serving non-economic gameplay from memory; economic actions
//! are gated until recovery, and retries run with exponential backoff plus
//! jitter, coalesced to the latest dirty revision.

use crate::ledger::IdempotencyLedger;
use log::{info, warn};
use rand::Rng;
use shared::{RoomId, RoomState};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEBOUNCE_INTERVAL: Duration = Duration::from_secs(2);
pub const SAFETY_INTERVAL: Duration = Duration::from_secs(30);
pub const RETRY_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
pub const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
    #[error("checkpoint encoding failed: {0}")]
    Encoding(String),
}

/// Durable storage collaborator. One `save` call is one transactional
/// unit: the state blob, the idempotency ledger, and the revision commit
/// together or not at all. Persisting the ledger with the state is what
/// keeps at-most-once across a restart.
pub trait CheckpointStore {
    fn load(
        &mut self,
        room: RoomId,
    ) -> Result<Option<(RoomState, IdempotencyLedger, u64)>, PersistError>;
    fn save(
        &mut self,
        room: RoomId,
        state: &RoomState,
        ledger: &IdempotencyLedger,
        revision: u64,
    ) -> Result<(), PersistError>;
}

/// In-memory store used by the single-process server and tests. Stores the
/// bincode blob rather than the live struct so a load is a genuine
/// round-trip, and write failures can be injected.
#[derive(Debug, Default)]
pub struct MemoryStore {
    checkpoints: HashMap<RoomId, (Vec<u8>, u64)>,
    pub fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persisted_revision(&self, room: RoomId) -> Option<u64> {
        self.checkpoints.get(&room).map(|(_, revision)| *revision)
    }
}

impl CheckpointStore for MemoryStore {
    fn load(
        &mut self,
        room: RoomId,
    ) -> Result<Option<(RoomState, IdempotencyLedger, u64)>, PersistError> {
        match self.checkpoints.get(&room) {
            Some((blob, revision)) => {
                let (state, ledger): (RoomState, IdempotencyLedger) = bincode::deserialize(blob)
                    .map_err(|e| PersistError::Encoding(e.to_string()))?;
                Ok(Some((state, ledger, *revision)))
            }
            None => Ok(None),
        }
    }

    fn save(
        &mut self,
        room: RoomId,
        state: &RoomState,
        ledger: &IdempotencyLedger,
        revision: u64,
    ) -> Result<(), PersistError> {
        if self.fail_writes {
            return Err(PersistError::Unavailable("injected write failure".into()));
        }
        let blob = bincode::serialize(&(state, ledger))
            .map_err(|e| PersistError::Encoding(e.to_string()))?;
        self.checkpoints.insert(room, (blob, revision));
        Ok(())
    }
}

/// Observable counters for failure/recovery transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMetrics {
    pub degraded: bool,
    pub failure_count: u64,
    pub last_persisted_revision: u64,
    pub oldest_unpersisted_revision: Option<u64>,
    pub last_retry_latency_ms: Option<u64>,
}

pub struct Checkpointer<S: CheckpointStore> {
    store: S,
    room: RoomId,
    last_persisted_revision: u64,
    oldest_dirty_revision: Option<u64>,
    persist_failed: bool,
    failure_count: u64,
    backoff: Duration,
    next_retry_at: Option<Instant>,
    last_flush_attempt: Instant,
    last_success: Instant,
    last_retry_latency: Option<Duration>,
}

impl<S: CheckpointStore> Checkpointer<S> {
    pub fn new(store: S, room: RoomId, persisted_revision: u64) -> Self {
        let now = Instant::now();
        Self {
            store,
            room,
            last_persisted_revision: persisted_revision,
            oldest_dirty_revision: None,
            persist_failed: false,
            failure_count: 0,
            backoff: RETRY_BACKOFF_INITIAL,
            next_retry_at: None,
            last_flush_attempt: now,
            last_success: now,
            last_retry_latency: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn is_degraded(&self) -> bool {
        self.persist_failed
    }

    pub fn is_dirty(&self) -> bool {
        self.oldest_dirty_revision.is_some()
    }

    pub fn last_persisted_revision(&self) -> u64 {
        self.last_persisted_revision
    }

    pub fn metrics(&self) -> CheckpointMetrics {
        CheckpointMetrics {
            degraded: self.persist_failed,
            failure_count: self.failure_count,
            last_persisted_revision: self.last_persisted_revision,
            oldest_unpersisted_revision: self.oldest_dirty_revision,
            last_retry_latency_ms: self.last_retry_latency.map(|d| d.as_millis() as u64),
        }
    }

    /// Marks a newly committed revision as awaiting durability.
    pub fn mark_dirty(&mut self, revision: u64) {
        if self.oldest_dirty_revision.is_none() {
            self.oldest_dirty_revision = Some(revision);
        }
    }

    /// Immediate flush for critical actions and lifecycle events. The
    /// caller holds the client-visible acknowledgment until this returns.
    pub fn flush_now(
        &mut self,
        state: &RoomState,
        ledger: &IdempotencyLedger,
    ) -> Result<(), PersistError> {
        self.try_flush(state, ledger, Instant::now())
    }

    /// Periodic driver: debounce flushes while dirty, the longer safety
    /// flush, and backoff-scheduled retries while degraded. Superseded
    /// intermediate snapshots are dropped, not queued — a flush always
    /// writes the latest state.
    pub fn tick(&mut self, state: &RoomState, ledger: &IdempotencyLedger, now: Instant) {
        if !self.is_dirty() {
            return;
        }
        if self.persist_failed {
            if self.next_retry_at.map(|at| now >= at).unwrap_or(true) {
                let started = Instant::now();
                let result = self.try_flush(state, ledger, now);
                self.last_retry_latency = Some(started.elapsed());
                let _ = result;
            }
            return;
        }
        let debounce_due = now.duration_since(self.last_flush_attempt) >= DEBOUNCE_INTERVAL;
        let safety_due = now.duration_since(self.last_success) >= SAFETY_INTERVAL;
        if debounce_due || safety_due {
            let _ = self.try_flush(state, ledger, now);
        }
    }

    fn try_flush(
        &mut self,
        state: &RoomState,
        ledger: &IdempotencyLedger,
        now: Instant,
    ) -> Result<(), PersistError> {
        self.last_flush_attempt = now;
        match self.store.save(self.room, state, ledger, state.revision) {
            Ok(()) => {
                if self.persist_failed {
                    info!(
                        "persistence recovered: room={} revision={} after {} failures",
                        self.room.0, state.revision, self.failure_count
                    );
                }
                self.persist_failed = false;
                self.backoff = RETRY_BACKOFF_INITIAL;
                self.next_retry_at = None;
                self.last_persisted_revision = state.revision;
                self.oldest_dirty_revision = None;
                self.last_success = now;
                Ok(())
            }
            Err(e) => {
                self.failure_count += 1;
                if !self.persist_failed {
                    warn!(
                        "persistence degraded: room={} oldest_unpersisted={:?} error={}",
                        self.room.0, self.oldest_dirty_revision, e
                    );
                }
                self.persist_failed = true;
                self.next_retry_at = Some(now + jittered(self.backoff));
                self.backoff = (self.backoff * 2).min(RETRY_BACKOFF_CAP);
                Err(e)
            }
        }
    }
}

/// Applies +/-50% jitter so concurrent rooms do not retry in lockstep.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}
