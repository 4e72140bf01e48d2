//! Action intents: each action kind is a tagged variant with its own
//! statically validated payload shape. The server dispatches on the kind
//! through the validator's per-kind handlers rather than inspecting loose
//! fields.

use crate::types::{ActionId, GridPos, ItemCode, ItemInstanceId, Rotation};
use serde::{Deserialize, Serialize};

/// A client intent as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Idempotency key; created once per intent, reused verbatim on retry.
    pub action_id: ActionId,
    /// Client-observed room revision for optimistic-concurrency kinds
    /// (place/move/pickup). Compared against the current revision as an
    /// explicit compare-and-swap.
    pub base_revision: Option<u64>,
    pub payload: ActionPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionPayload {
    MoveTo {
        pos: GridPos,
        input_seq: u32,
    },
    Emote {
        emote: String,
    },
    PlantCrop {
        pos: GridPos,
        seed: ItemCode,
    },
    HarvestCrop {
        pos: GridPos,
    },
    StartIncubation {
        pos: GridPos,
        egg: ItemCode,
    },
    CollectHatch {
        pos: GridPos,
    },
    PlaceItem {
        item: ItemCode,
        pos: GridPos,
        rotation: Rotation,
    },
    MoveItem {
        instance: ItemInstanceId,
        pos: GridPos,
        rotation: Rotation,
    },
    PickUpItem {
        instance: ItemInstanceId,
    },
    PurchaseItem {
        item: ItemCode,
        quantity: u32,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::MoveTo { .. } => ActionKind::MoveTo,
            ActionPayload::Emote { .. } => ActionKind::Emote,
            ActionPayload::PlantCrop { .. } => ActionKind::PlantCrop,
            ActionPayload::HarvestCrop { .. } => ActionKind::HarvestCrop,
            ActionPayload::StartIncubation { .. } => ActionKind::StartIncubation,
            ActionPayload::CollectHatch { .. } => ActionKind::CollectHatch,
            ActionPayload::PlaceItem { .. } => ActionKind::PlaceItem,
            ActionPayload::MoveItem { .. } => ActionKind::MoveItem,
            ActionPayload::PickUpItem { .. } => ActionKind::PickUpItem,
            ActionPayload::PurchaseItem { .. } => ActionKind::PurchaseItem,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    MoveTo,
    Emote,
    PlantCrop,
    HarvestCrop,
    StartIncubation,
    CollectHatch,
    PlaceItem,
    MoveItem,
    PickUpItem,
    PurchaseItem,
}

/// Idempotency retention class of an action kind. Retention windows
/// strictly exceed the maximum client retry horizon so expiry can never
/// let a plausible retry reprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionClass {
    /// Reward-granting: harvest, hatch collection, purchase.
    Reward,
    /// Consuming or durable-placement kinds.
    Consume,
    /// Non-economic, short-lived kinds.
    Short,
}

impl ActionKind {
    pub fn retention_class(self) -> RetentionClass {
        match self {
            ActionKind::HarvestCrop | ActionKind::CollectHatch | ActionKind::PurchaseItem => {
                RetentionClass::Reward
            }
            ActionKind::PlantCrop
            | ActionKind::StartIncubation
            | ActionKind::PlaceItem
            | ActionKind::MoveItem
            | ActionKind::PickUpItem => RetentionClass::Consume,
            ActionKind::MoveTo | ActionKind::Emote => RetentionClass::Short,
        }
    }

    /// Economically sensitive kinds are gated while persistence is degraded.
    pub fn is_economic(self) -> bool {
        !matches!(self, ActionKind::MoveTo | ActionKind::Emote)
    }

    /// Kinds whose success acknowledgment must wait for a durable
    /// checkpoint: high-value economic mutations.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            ActionKind::PurchaseItem
                | ActionKind::HarvestCrop
                | ActionKind::CollectHatch
                | ActionKind::PlaceItem
                | ActionKind::PickUpItem
        )
    }

    /// Pipeline-safe kinds may overlap on the same entity client-side
    /// without taking an exclusive prediction lock.
    pub fn is_pipeline_safe(self) -> bool {
        matches!(self, ActionKind::MoveTo | ActionKind::Emote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            ActionKind::HarvestCrop.retention_class(),
            RetentionClass::Reward
        );
        assert_eq!(
            ActionKind::PlantCrop.retention_class(),
            RetentionClass::Consume
        );
        assert_eq!(ActionKind::Emote.retention_class(), RetentionClass::Short);

        assert!(ActionKind::PurchaseItem.is_economic());
        assert!(!ActionKind::MoveTo.is_economic());

        assert!(ActionKind::PurchaseItem.is_critical());
        assert!(!ActionKind::MoveItem.is_critical());
        assert!(!ActionKind::PlantCrop.is_critical());

        assert!(ActionKind::MoveTo.is_pipeline_safe());
        assert!(!ActionKind::PlaceItem.is_pipeline_safe());
    }

    #[test]
    fn test_payload_kind_mapping() {
        let payload = ActionPayload::HarvestCrop {
            pos: GridPos::new(1, 1),
        };
        assert_eq!(payload.kind(), ActionKind::HarvestCrop);
    }
}
