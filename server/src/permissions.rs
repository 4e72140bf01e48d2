//! Permission resolution: maps an actor to a role for a room, then checks
//! the role against a static per-kind policy table.
//!
//! A denied action is terminal, consumes no revision, and is logged with
//! room id, actor, kind, and current revision for audit.

use log::warn;
use shared::{ActionKind, Role, RoomState, UserId};

/// Derives the actor's role from room ownership and the room's guest
/// policy. Roles are never client-supplied.
pub fn resolve(actor: UserId, room: &RoomState) -> Role {
    if actor == room.owner {
        Role::Owner
    } else if room.guest_interaction_enabled {
        Role::InteractiveGuest
    } else {
        Role::ReadOnlyGuest
    }
}

/// Static policy table. Movement and emotes are open to every role;
/// gameplay mutations require ownership or the interactive-guest grant.
/// Purchases stay owner-only since they debit a wallet.
pub fn is_allowed(role: Role, kind: ActionKind) -> bool {
    match kind {
        ActionKind::MoveTo | ActionKind::Emote => true,
        ActionKind::PurchaseItem => role == Role::Owner,
        ActionKind::PlantCrop
        | ActionKind::HarvestCrop
        | ActionKind::StartIncubation
        | ActionKind::CollectHatch
        | ActionKind::PlaceItem
        | ActionKind::MoveItem
        | ActionKind::PickUpItem => matches!(role, Role::Owner | Role::InteractiveGuest),
    }
}

/// Audit log entry for a denial.
pub fn log_denial(actor: UserId, kind: ActionKind, room: &RoomState) {
    warn!(
        "permission denied: room={} actor={} kind={:?} revision={}",
        room.room_id.0, actor.0, kind, room.revision
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::RoomId;

    fn room(guest_interaction: bool) -> RoomState {
        let mut state = RoomState::new(RoomId(1), UserId(10), 8, 8);
        state.guest_interaction_enabled = guest_interaction;
        state
    }

    #[test]
    fn test_owner_role() {
        assert_eq!(resolve(UserId(10), &room(false)), Role::Owner);
    }

    #[test]
    fn test_guest_roles_follow_room_flag() {
        assert_eq!(resolve(UserId(20), &room(false)), Role::ReadOnlyGuest);
        assert_eq!(resolve(UserId(20), &room(true)), Role::InteractiveGuest);
    }

    #[test]
    fn test_movement_open_to_all() {
        for role in [Role::Owner, Role::InteractiveGuest, Role::ReadOnlyGuest] {
            assert!(is_allowed(role, ActionKind::MoveTo));
            assert!(is_allowed(role, ActionKind::Emote));
        }
    }

    #[test]
    fn test_gameplay_denied_to_read_only_guest() {
        for kind in [
            ActionKind::PlantCrop,
            ActionKind::HarvestCrop,
            ActionKind::PlaceItem,
            ActionKind::PurchaseItem,
        ] {
            assert!(!is_allowed(Role::ReadOnlyGuest, kind));
        }
    }

    #[test]
    fn test_interactive_guest_cannot_purchase() {
        assert!(is_allowed(Role::InteractiveGuest, ActionKind::PlantCrop));
        assert!(is_allowed(Role::InteractiveGuest, ActionKind::HarvestCrop));
        assert!(!is_allowed(Role::InteractiveGuest, ActionKind::PurchaseItem));
    }
}
