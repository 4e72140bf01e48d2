//! End-to-end scenarios driving the authoritative engine and the client
//! reconciliation engine against each other in-process, without sockets,
//! so every exchange is deterministic.

use client::reconcile::{ClientEvent, Reconciler};
use server::checkpoint::{Checkpointer, MemoryStore};
use server::economy::MemoryEconomy;
use server::engine::{RoomEngine, SubmitOutcome};
use shared::{
    ActionPayload, ActionRequest, Catalog, GridPos, RejectCode, RoomId, RoomState, Rotation,
    SessionId, TileEntity, UserId,
};
use std::time::Instant;

const ROOM: RoomId = RoomId(1);
const OWNER: UserId = UserId(10);
const GUEST: UserId = UserId(66);

/// One room server: engine plus checkpointer, wired the way the network
/// loop wires them.
struct Harness {
    engine: RoomEngine<MemoryEconomy>,
    checkpointer: Checkpointer<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let mut state = RoomState::new(ROOM, OWNER, 8, 8);
        state.guest_interaction_enabled = true;
        let mut engine = RoomEngine::new(state, MemoryEconomy::new(), Catalog::demo());
        engine.bootstrap_owner(100, &[("carrot_seed".to_string(), 3)]);
        Self {
            engine,
            checkpointer: Checkpointer::new(MemoryStore::new(), ROOM, 0),
        }
    }

    fn submit(
        &mut self,
        session: SessionId,
        actor: UserId,
        request: &ActionRequest,
        now_ms: u64,
    ) -> SubmitOutcome {
        let checkpointer = &mut self.checkpointer;
        let degraded = checkpointer.is_degraded();
        self.engine
            .submit(session, actor, request, now_ms, degraded, |state, ledger| {
                checkpointer.flush_now(state, ledger)
            })
    }
}

fn owner_client(h: &mut Harness) -> Reconciler {
    h.engine.join(SessionId(1), OWNER);
    Reconciler::new(SessionId(1), OWNER, h.engine.snapshot(), Catalog::demo())
}

fn request(payload: ActionPayload) -> ActionRequest {
    ActionRequest {
        action_id: shared::ActionId::generate(),
        base_revision: None,
        payload,
    }
}

#[test]
fn test_plant_then_harvest_converges_bit_for_bit() {
    let mut h = Harness::new();
    let mut rec = owner_client(&mut h);
    let plot = GridPos::new(2, 2);

    // Plant: predicted locally, confirmed by the server.
    let plant = rec
        .submit(
            ActionPayload::PlantCrop {
                pos: plot,
                seed: "carrot_seed".to_string(),
            },
            Instant::now(),
        )
        .unwrap();
    let outcome = h.submit(SessionId(1), OWNER, &plant, 0);
    rec.handle_result(plant.action_id, outcome.result, Instant::now());
    assert_eq!(rec.state(), &h.engine.snapshot());
    assert_eq!(rec.mismatches(), 0);

    // Too early: server rejects, client rolls back, views stay identical.
    let early = rec
        .submit(ActionPayload::HarvestCrop { pos: plot }, Instant::now())
        .unwrap();
    let outcome = h.submit(SessionId(1), OWNER, &early, 100_000);
    assert_eq!(
        outcome.result.clone().unwrap_err().code,
        RejectCode::NotReady {
            ready_at_ms: 120_000
        }
    );
    rec.handle_result(early.action_id, outcome.result, Instant::now());
    assert_eq!(rec.state(), &h.engine.snapshot());

    // Ready: coins and loot land exactly once on both sides.
    let harvest = rec
        .submit(ActionPayload::HarvestCrop { pos: plot }, Instant::now())
        .unwrap();
    let outcome = h.submit(SessionId(1), OWNER, &harvest, 120_001);
    assert!(outcome.result.is_ok());
    rec.handle_result(harvest.action_id, outcome.result, Instant::now());

    assert_eq!(h.engine.state().wallet(OWNER), 125);
    assert_eq!(h.engine.state().inventory_count(OWNER, "carrot"), 1);
    assert!(h.engine.state().tile(plot).is_empty());
    assert_eq!(rec.state(), &h.engine.snapshot());
}

#[test]
fn test_duplicate_harvest_pays_once() {
    let mut h = Harness::new();
    let mut rec = owner_client(&mut h);
    let plot = GridPos::new(1, 1);

    let plant = rec
        .submit(
            ActionPayload::PlantCrop {
                pos: plot,
                seed: "carrot_seed".to_string(),
            },
            Instant::now(),
        )
        .unwrap();
    let outcome = h.submit(SessionId(1), OWNER, &plant, 0);
    rec.handle_result(plant.action_id, outcome.result, Instant::now());

    let harvest = rec
        .submit(ActionPayload::HarvestCrop { pos: plot }, Instant::now())
        .unwrap();

    // The original and a transport retransmit both reach the server.
    let first = h.submit(SessionId(1), OWNER, &harvest, 120_001);
    let second = h.submit(SessionId(1), OWNER, &harvest, 120_300);
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert_eq!(first.result, second.result);
    assert!(second.broadcast_patch().is_none());
    assert_eq!(h.engine.state().wallet(OWNER), 125);

    // The client resolves on the first result; the replayed one is a
    // no-op because the pending record is already gone.
    rec.handle_result(harvest.action_id, first.result, Instant::now());
    let events = rec.handle_result(harvest.action_id, second.result, Instant::now());
    assert!(events.is_empty());
    assert_eq!(rec.state(), &h.engine.snapshot());
}

#[test]
fn test_duplicate_purchase_debits_once() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);
    let purchase = request(ActionPayload::PurchaseItem {
        item: "carrot_seed".to_string(),
        quantity: 3,
    });

    let first = h.submit(SessionId(1), OWNER, &purchase, 0);
    let second = h.submit(SessionId(1), OWNER, &purchase, 50);
    assert!(first.result.is_ok());
    assert!(second.duplicate);
    assert_eq!(h.engine.state().wallet(OWNER), 70);
    assert_eq!(h.engine.state().inventory_count(OWNER, "carrot_seed"), 6);
}

#[test]
fn test_insufficient_funds_never_goes_negative() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);
    let purchase = request(ActionPayload::PurchaseItem {
        item: "gecko_egg".to_string(),
        quantity: 2, // 240 > 100
    });
    let outcome = h.submit(SessionId(1), OWNER, &purchase, 0);
    assert_eq!(
        outcome.result.unwrap_err().code,
        RejectCode::InsufficientFunds {
            needed: 240,
            available: 100
        }
    );
    assert_eq!(h.engine.state().wallet(OWNER), 100);
}

#[test]
fn test_placement_race_has_one_winner_and_views_converge() {
    let mut h = Harness::new();
    h.engine
        .bootstrap_owner(0, &[("wooden_chair".to_string(), 2)]);
    h.engine.join(SessionId(1), OWNER);
    h.engine.join(SessionId(2), GUEST);
    let mut rec_a = Reconciler::new(SessionId(1), OWNER, h.engine.snapshot(), Catalog::demo());
    let mut rec_b = Reconciler::new(SessionId(2), GUEST, h.engine.snapshot(), Catalog::demo());

    let spot = GridPos::new(4, 4);
    let place = |rec: &mut Reconciler| {
        rec.submit(
            ActionPayload::PlaceItem {
                item: "wooden_chair".to_string(),
                pos: spot,
                rotation: Rotation::R0,
            },
            Instant::now(),
        )
        .unwrap()
    };
    let req_a = place(&mut rec_a);
    let req_b = place(&mut rec_b);

    // Server arrival order decides: A wins, B gets Occupied.
    let out_a = h.submit(SessionId(1), OWNER, &req_a, 0);
    let out_b = h.submit(SessionId(2), GUEST, &req_b, 1);
    assert!(out_a.result.is_ok());
    assert_eq!(out_b.result.clone().unwrap_err().code, RejectCode::Occupied);
    assert_eq!(h.engine.state().items.len(), 1);

    // A resolves its ack; B first sees A's broadcast, then its rejection.
    rec_a.handle_result(req_a.action_id, out_a.result.clone(), Instant::now());
    rec_b.handle_push(out_a.broadcast_patch().unwrap());
    rec_b.handle_result(req_b.action_id, out_b.result, Instant::now());

    assert_eq!(rec_a.state(), &h.engine.snapshot());
    assert_eq!(rec_b.state(), &h.engine.snapshot());
}

#[test]
fn test_degraded_store_gates_economy_until_recovery() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);
    h.checkpointer.store_mut().fail_writes = true;

    // The critical flush fails, the purchase is rolled back, and the
    // store is now known-degraded.
    let purchase = request(ActionPayload::PurchaseItem {
        item: "carrot_seed".to_string(),
        quantity: 1,
    });
    let outcome = h.submit(SessionId(1), OWNER, &purchase, 0);
    assert_eq!(
        outcome.result.unwrap_err().code,
        RejectCode::PersistenceDegraded
    );
    assert_eq!(h.engine.state().wallet(OWNER), 100);
    assert!(h.checkpointer.is_degraded());

    // While degraded, economic intents are rejected up front but
    // movement still works from memory.
    let retry = request(purchase.payload.clone());
    let outcome = h.submit(SessionId(1), OWNER, &retry, 100);
    assert_eq!(
        outcome.result.unwrap_err().code,
        RejectCode::PersistenceDegraded
    );
    let movement = request(ActionPayload::MoveTo {
        pos: GridPos::new(3, 3),
        input_seq: 1,
    });
    assert!(h.submit(SessionId(1), OWNER, &movement, 200).result.is_ok());

    // Store recovers; the next purchase goes through and is durable.
    h.checkpointer.store_mut().fail_writes = false;
    h.checkpointer
        .flush_now(&h.engine.snapshot(), h.engine.idempotency())
        .unwrap();
    assert!(!h.checkpointer.is_degraded());

    let after = request(purchase.payload.clone());
    let outcome = h.submit(SessionId(1), OWNER, &after, 300);
    assert!(outcome.result.is_ok());
    assert_eq!(h.engine.state().wallet(OWNER), 90);
    assert_eq!(
        h.checkpointer.store().persisted_revision(ROOM),
        Some(h.engine.state().revision)
    );
}

#[test]
fn test_checkpoint_survives_restart() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);
    let purchase = request(ActionPayload::PurchaseItem {
        item: "wooden_chair".to_string(),
        quantity: 1,
    });
    assert!(h.submit(SessionId(1), OWNER, &purchase, 0).result.is_ok());
    let revision = h.engine.state().revision;

    // A new engine built from the stored checkpoint carries the purchase
    // but drops stale presences.
    use server::checkpoint::CheckpointStore;
    let (recovered, ledger, stored_revision) =
        h.checkpointer.store_mut().load(ROOM).unwrap().unwrap();
    assert_eq!(stored_revision, revision);
    let engine = RoomEngine::recover(recovered, ledger, MemoryEconomy::new(), Catalog::demo());
    assert_eq!(engine.state().revision, revision);
    assert_eq!(engine.state().inventory_count(OWNER, "wooden_chair"), 1);
    assert_eq!(engine.state().wallet(OWNER), 60);
    assert!(engine.state().presences.is_empty());
}

#[test]
fn test_retransmit_after_restart_replays_recorded_result() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);
    let purchase = request(ActionPayload::PurchaseItem {
        item: "carrot_seed".to_string(),
        quantity: 3,
    });
    let first = h.submit(SessionId(1), OWNER, &purchase, 0);
    assert!(first.result.is_ok());
    assert_eq!(h.engine.state().wallet(OWNER), 70);

    // Crash before the ack reached the client: rebuild from the durable
    // checkpoint, exactly as server startup does.
    use server::checkpoint::CheckpointStore;
    let (state, ledger, _) = h.checkpointer.store_mut().load(ROOM).unwrap().unwrap();
    let mut engine = RoomEngine::recover(state, ledger, MemoryEconomy::new(), Catalog::demo());
    engine.join(SessionId(1), OWNER);

    // The client retransmits the same action id; the recovered ledger
    // replays the recorded result instead of debiting again.
    let second = engine.submit(SessionId(1), OWNER, &purchase, 500, false, |_, _| Ok(()));
    assert!(second.duplicate);
    assert_eq!(second.result, first.result);
    assert_eq!(engine.state().wallet(OWNER), 70);
    assert_eq!(engine.state().inventory_count(OWNER, "carrot_seed"), 6);
    assert!(engine.economy().entries().is_empty());
}

#[test]
fn test_revision_gap_forces_resync() {
    let mut h = Harness::new();
    let mut rec = owner_client(&mut h);

    // Two server-side mutations happen, but only the second push reaches
    // the client.
    let p1 = request(ActionPayload::PlantCrop {
        pos: GridPos::new(1, 1),
        seed: "carrot_seed".to_string(),
    });
    let p2 = request(ActionPayload::PlantCrop {
        pos: GridPos::new(2, 2),
        seed: "carrot_seed".to_string(),
    });
    h.submit(SessionId(1), OWNER, &p1, 0);
    let second = h.submit(SessionId(1), OWNER, &p2, 10);

    let events = rec.handle_push(second.broadcast_patch().unwrap());
    assert_eq!(events, vec![ClientEvent::NeedResync]);

    // The full snapshot brings the client back in line.
    rec.handle_snapshot(h.engine.snapshot(), Instant::now());
    assert_eq!(rec.state(), &h.engine.snapshot());
}

#[test]
fn test_stale_movement_is_discarded_without_revision() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);

    let newer = request(ActionPayload::MoveTo {
        pos: GridPos::new(5, 5),
        input_seq: 2,
    });
    assert!(h.submit(SessionId(1), OWNER, &newer, 0).result.is_ok());
    let revision = h.engine.state().revision;

    // A reordered older input arrives afterwards: accepted as a no-op,
    // no revision consumed, position unchanged.
    let older = request(ActionPayload::MoveTo {
        pos: GridPos::new(1, 1),
        input_seq: 1,
    });
    let outcome = h.submit(SessionId(1), OWNER, &older, 10);
    assert!(outcome.result.as_ref().unwrap().is_empty());
    assert_eq!(h.engine.state().revision, revision);
    assert_eq!(
        h.engine.state().presences[&SessionId(1)].pos,
        GridPos::new(5, 5)
    );
}

#[test]
fn test_stale_base_revision_on_furniture_rejected() {
    let mut h = Harness::new();
    h.engine
        .bootstrap_owner(0, &[("wooden_chair".to_string(), 1)]);
    h.engine.join(SessionId(1), OWNER);
    let observed = h.engine.state().revision;

    // Something else advances the room after the client observed it.
    let plant = request(ActionPayload::PlantCrop {
        pos: GridPos::new(1, 1),
        seed: "carrot_seed".to_string(),
    });
    h.submit(SessionId(1), OWNER, &plant, 0);
    let current = h.engine.state().revision;

    let place = ActionRequest {
        action_id: shared::ActionId::generate(),
        base_revision: Some(observed),
        payload: ActionPayload::PlaceItem {
            item: "wooden_chair".to_string(),
            pos: GridPos::new(4, 4),
            rotation: Rotation::R0,
        },
    };
    let outcome = h.submit(SessionId(1), OWNER, &place, 10);
    assert_eq!(
        outcome.result.unwrap_err().code,
        RejectCode::StaleRevision { current }
    );
    assert!(h.engine.state().items.is_empty());
}

#[test]
fn test_guest_permissions_and_owner_economy_routing() {
    let mut h = Harness::new();
    h.engine.join(SessionId(1), OWNER);
    h.engine.join(SessionId(2), GUEST);

    // A guest may plant from the owner's stock.
    let plant = request(ActionPayload::PlantCrop {
        pos: GridPos::new(3, 3),
        seed: "carrot_seed".to_string(),
    });
    assert!(h.submit(SessionId(2), GUEST, &plant, 0).result.is_ok());
    assert_eq!(h.engine.state().inventory_count(OWNER, "carrot_seed"), 2);

    // A guest harvest credits the room owner, not the guest.
    let harvest = request(ActionPayload::HarvestCrop {
        pos: GridPos::new(3, 3),
    });
    assert!(h
        .submit(SessionId(2), GUEST, &harvest, 120_001)
        .result
        .is_ok());
    assert_eq!(h.engine.state().wallet(OWNER), 125);
    assert_eq!(h.engine.state().wallet(GUEST), 0);

    // Purchasing is owner-only.
    let purchase = request(ActionPayload::PurchaseItem {
        item: "carrot_seed".to_string(),
        quantity: 1,
    });
    let outcome = h.submit(SessionId(2), GUEST, &purchase, 120_100);
    assert_eq!(
        outcome.result.unwrap_err().code,
        RejectCode::PermissionDenied
    );
}

#[test]
fn test_incubation_and_collect_flow() {
    let mut h = Harness::new();
    h.engine.bootstrap_owner(0, &[("gecko_egg".to_string(), 1)]);
    h.engine.join(SessionId(1), OWNER);
    let pos = GridPos::new(6, 6);

    let start = request(ActionPayload::StartIncubation {
        pos,
        egg: "gecko_egg".to_string(),
    });
    assert!(h.submit(SessionId(1), OWNER, &start, 0).result.is_ok());
    assert!(matches!(
        h.engine.state().tile(pos),
        TileEntity::Incubator { .. }
    ));

    // Too early.
    let early = request(ActionPayload::CollectHatch { pos });
    assert!(matches!(
        h.submit(SessionId(1), OWNER, &early, 200_000)
            .result
            .unwrap_err()
            .code,
        RejectCode::NotReady { .. }
    ));

    // Hatched.
    let collect = request(ActionPayload::CollectHatch { pos });
    assert!(h
        .submit(SessionId(1), OWNER, &collect, 300_001)
        .result
        .is_ok());
    assert_eq!(h.engine.state().inventory_count(OWNER, "gecko"), 1);
    assert!(h.engine.state().tile(pos).is_empty());
}
