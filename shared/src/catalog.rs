//! Read-only item catalog: prices, growth/hatch durations, footprints, and
//! loot, keyed by a stable item code. The server treats this as the only
//! source of these values; it never accepts them from a client. The client
//! keeps an identical copy purely for local prediction.

use crate::types::{Footprint, ItemCode};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ItemDef {
    pub code: ItemCode,
    /// Purchase price in coins per unit.
    pub price: u64,
    pub kind: ItemDefKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ItemDefKind {
    Seed {
        growth_ms: u64,
        /// Coins credited on harvest.
        yield_coins: u64,
        /// Optional item loot granted alongside the coins.
        yield_item: Option<(ItemCode, u32)>,
    },
    Egg {
        hatch_ms: u64,
        reward_item: (ItemCode, u32),
    },
    Furniture {
        footprint: Footprint,
    },
    /// Produce, hatched pets, and other stack-only goods.
    Goods,
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    items: HashMap<ItemCode, ItemDef>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, def: ItemDef) {
        self.items.insert(def.code.clone(), def);
    }

    pub fn get(&self, code: &str) -> Option<&ItemDef> {
        self.items.get(code)
    }

    /// Fixture catalog used by the demo binaries and tests.
    pub fn demo() -> Self {
        let mut catalog = Self::new();
        catalog.insert(ItemDef {
            code: "carrot_seed".to_string(),
            price: 10,
            kind: ItemDefKind::Seed {
                growth_ms: 120_000,
                yield_coins: 25,
                yield_item: Some(("carrot".to_string(), 1)),
            },
        });
        catalog.insert(ItemDef {
            code: "turnip_seed".to_string(),
            price: 6,
            kind: ItemDefKind::Seed {
                growth_ms: 60_000,
                yield_coins: 12,
                yield_item: None,
            },
        });
        catalog.insert(ItemDef {
            code: "gecko_egg".to_string(),
            price: 120,
            kind: ItemDefKind::Egg {
                hatch_ms: 300_000,
                reward_item: ("gecko".to_string(), 1),
            },
        });
        catalog.insert(ItemDef {
            code: "wooden_chair".to_string(),
            price: 40,
            kind: ItemDefKind::Furniture {
                footprint: Footprint::new(1, 1),
            },
        });
        catalog.insert(ItemDef {
            code: "garden_bench".to_string(),
            price: 90,
            kind: ItemDefKind::Furniture {
                footprint: Footprint::new(2, 1),
            },
        });
        catalog.insert(ItemDef {
            code: "carrot".to_string(),
            price: 0,
            kind: ItemDefKind::Goods,
        });
        catalog.insert(ItemDef {
            code: "gecko".to_string(),
            price: 0,
            kind: ItemDefKind::Goods,
        });
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_catalog_lookup() {
        let catalog = Catalog::demo();
        let carrot = catalog.get("carrot_seed").unwrap();
        assert_eq!(carrot.price, 10);
        match &carrot.kind {
            ItemDefKind::Seed {
                growth_ms,
                yield_coins,
                ..
            } => {
                assert_eq!(*growth_ms, 120_000);
                assert_eq!(*yield_coins, 25);
            }
            _ => panic!("carrot_seed should be a seed"),
        }
        assert!(catalog.get("unobtainium").is_none());
    }
}
