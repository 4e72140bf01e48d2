//! Economy ledger collaborator: append-only entries with atomic balance
//! updates. A debit that would drive a balance negative is rejected and
//! appends nothing.

use serde::{Deserialize, Serialize};
use shared::{ActionId, UserId};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EconomyError {
    #[error("insufficient funds: need {needed}, have {available}")]
    Insufficient { needed: u64, available: u64 },
}

/// One immutable ledger entry. Entries are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EconomyEntry {
    pub entry_id: u64,
    pub user: UserId,
    /// Signed delta: positive for credit, negative for debit.
    pub delta: i64,
    pub balance_after: u64,
    pub reason: String,
    pub reference: Option<ActionId>,
}

/// Collaborator interface the room engine drives. The append is atomic
/// with the balance update.
pub trait EconomyLedger {
    fn balance(&self, user: UserId) -> u64;

    fn credit(
        &mut self,
        user: UserId,
        amount: u64,
        reason: &str,
        reference: Option<ActionId>,
    ) -> (u64, u64);

    fn debit(
        &mut self,
        user: UserId,
        amount: u64,
        reason: &str,
        reference: Option<ActionId>,
    ) -> Result<(u64, u64), EconomyError>;
}

/// In-memory implementation backing the single-process server and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryEconomy {
    balances: HashMap<UserId, u64>,
    entries: Vec<EconomyEntry>,
}

impl MemoryEconomy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[EconomyEntry] {
        &self.entries
    }

    fn append(
        &mut self,
        user: UserId,
        delta: i64,
        balance_after: u64,
        reason: &str,
        reference: Option<ActionId>,
    ) -> u64 {
        let entry_id = self.entries.len() as u64;
        self.entries.push(EconomyEntry {
            entry_id,
            user,
            delta,
            balance_after,
            reason: reason.to_string(),
            reference,
        });
        entry_id
    }
}

impl EconomyLedger for MemoryEconomy {
    fn balance(&self, user: UserId) -> u64 {
        self.balances.get(&user).copied().unwrap_or(0)
    }

    fn credit(
        &mut self,
        user: UserId,
        amount: u64,
        reason: &str,
        reference: Option<ActionId>,
    ) -> (u64, u64) {
        let new_balance = self.balance(user) + amount;
        self.balances.insert(user, new_balance);
        let entry_id = self.append(user, amount as i64, new_balance, reason, reference);
        (new_balance, entry_id)
    }

    fn debit(
        &mut self,
        user: UserId,
        amount: u64,
        reason: &str,
        reference: Option<ActionId>,
    ) -> Result<(u64, u64), EconomyError> {
        let available = self.balance(user);
        if available < amount {
            return Err(EconomyError::Insufficient {
                needed: amount,
                available,
            });
        }
        let new_balance = available - amount;
        self.balances.insert(user, new_balance);
        let entry_id = self.append(user, -(amount as i64), new_balance, reason, reference);
        Ok((new_balance, entry_id))
    }
}
