// src/agent/ledger.rs
//! Budget ledger contract
//!
//! `reserve` holds an estimated cost against a user's allowance and either
//! grants or denies it. `commit` settles a grant with the actual cost and
//! releases the hold. The authoritative ledger lives outside this crate;
//! [`InMemoryLedger`] serves single-node deployments and tests.

use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Proof of a successful reservation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetGrant {
    pub user_id: String,
    pub estimated_cost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum BudgetDecision {
    Granted(BudgetGrant),
    Denied { remaining: u64 },
}

#[async_trait]
pub trait BudgetLedger: Send + Sync {
    async fn reserve(&self, user_id: &str, estimated_cost: u64) -> Result<BudgetDecision>;

    async fn commit(&self, grant: &BudgetGrant, actual_cost: u64) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
struct Account {
    balance: u64,
    held: u64,
}

/// Process-local ledger
pub struct InMemoryLedger {
    default_allowance: u64,
    accounts: Mutex<HashMap<String, Account>>,
}

impl InMemoryLedger {
    /// Every unseen user starts with `default_allowance`
    pub fn new(default_allowance: u64) -> Self {
        Self {
            default_allowance,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_balance(&self, user_id: &str, balance: u64) {
        let mut accounts = self.accounts.lock();
        accounts
            .entry(user_id.to_string())
            .or_insert(Account {
                balance: self.default_allowance,
                held: 0,
            })
            .balance = balance;
    }

    /// Balance minus outstanding holds
    pub fn available(&self, user_id: &str) -> u64 {
        let accounts = self.accounts.lock();
        match accounts.get(user_id) {
            Some(account) => account.balance.saturating_sub(account.held),
            None => self.default_allowance,
        }
    }
}

#[async_trait]
impl BudgetLedger for InMemoryLedger {
    async fn reserve(&self, user_id: &str, estimated_cost: u64) -> Result<BudgetDecision> {
        let mut accounts = self.accounts.lock();
        let account = accounts.entry(user_id.to_string()).or_insert(Account {
            balance: self.default_allowance,
            held: 0,
        });
        let remaining = account.balance.saturating_sub(account.held);
        if estimated_cost > remaining {
            debug!(user_id, estimated_cost, remaining, "budget reservation denied");
            return Ok(BudgetDecision::Denied { remaining });
        }
        account.held += estimated_cost;
        Ok(BudgetDecision::Granted(BudgetGrant {
            user_id: user_id.to_string(),
            estimated_cost,
        }))
    }

    async fn commit(&self, grant: &BudgetGrant, actual_cost: u64) -> Result<()> {
        let mut accounts = self.accounts.lock();
        let account = accounts
            .get_mut(&grant.user_id)
            .ok_or_else(|| EngineError::NotFound(format!("ledger account '{}'", grant.user_id)))?;
        account.held = account.held.saturating_sub(grant.estimated_cost);
        account.balance = account.balance.saturating_sub(actual_cost);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_holds_until_commit() {
        let ledger = InMemoryLedger::new(100);
        let grant = match ledger.reserve("alice", 60).await.unwrap() {
            BudgetDecision::Granted(grant) => grant,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(ledger.available("alice"), 40);
        assert_eq!(
            ledger.reserve("alice", 50).await.unwrap(),
            BudgetDecision::Denied { remaining: 40 }
        );

        ledger.commit(&grant, 25).await.unwrap();
        assert_eq!(ledger.available("alice"), 75);
    }

    #[tokio::test]
    async fn test_zero_commit_releases_hold() {
        let ledger = InMemoryLedger::new(10);
        let BudgetDecision::Granted(grant) = ledger.reserve("bob", 10).await.unwrap() else {
            panic!("expected grant");
        };
        ledger.commit(&grant, 0).await.unwrap();
        assert_eq!(ledger.available("bob"), 10);
    }

    #[tokio::test]
    async fn test_set_balance() {
        let ledger = InMemoryLedger::new(10);
        ledger.set_balance("carol", 0);
        assert!(matches!(
            ledger.reserve("carol", 1).await.unwrap(),
            BudgetDecision::Denied { remaining: 0 }
        ));
    }
}
