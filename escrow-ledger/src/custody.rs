//! Custody - value transfer into and out of escrow
//!
//! The ledger never moves value itself. It asks a [`ValueTransfer`]
//! implementation to collect a deposit into custody and to pay custody out
//! to a payee, and treats any failure there as a failed operation.
//! [`InMemoryTreasury`] is the in-process implementation used by the node,
//! the CLI and the tests.

use crate::{
    error::LedgerError,
    models::{Amount, Identity},
    LedgerResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Value-transfer primitive the ledger calls to move funds
#[async_trait]
pub trait ValueTransfer: Send + Sync {
    /// Move `amount` from `from` into custody
    async fn collect(&self, from: &Identity, amount: Amount) -> LedgerResult<()>;

    /// Move `amount` out of custody to `to`
    async fn pay(&self, to: &Identity, amount: Amount) -> LedgerResult<()>;
}

#[derive(Debug, Default)]
struct TreasuryState {
    balances: HashMap<Identity, Amount>,
    custody: Amount,
    rejected_payees: HashSet<Identity>,
}

/// In-memory balances plus a single custody account
#[derive(Debug, Default)]
pub struct InMemoryTreasury {
    state: RwLock<TreasuryState>,
}

impl InMemoryTreasury {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add external funds to an identity's balance
    pub async fn credit(&self, identity: &Identity, amount: Amount) -> LedgerResult<Amount> {
        let mut state = self.state.write().await;
        let balance = state.balances.entry(identity.clone()).or_default();
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::transfer_failed("balance overflow"))?;
        debug!("Credited {} to {}", amount, identity);
        Ok(*balance)
    }

    pub async fn balance_of(&self, identity: &Identity) -> Amount {
        self.state
            .read()
            .await
            .balances
            .get(identity)
            .copied()
            .unwrap_or_default()
    }

    /// Value currently held on behalf of escrow records
    pub async fn custody_balance(&self) -> Amount {
        self.state.read().await.custody
    }

    /// Make every payout to `identity` fail, as a rejecting recipient would
    pub async fn reject_payments_to(&self, identity: &Identity) {
        self.state
            .write()
            .await
            .rejected_payees
            .insert(identity.clone());
    }

    pub async fn accept_payments_to(&self, identity: &Identity) {
        self.state.write().await.rejected_payees.remove(identity);
    }
}

#[async_trait]
impl ValueTransfer for InMemoryTreasury {
    async fn collect(&self, from: &Identity, amount: Amount) -> LedgerResult<()> {
        let mut state = self.state.write().await;

        let available = state.balances.get(from).copied().unwrap_or_default();
        let remaining = available.checked_sub(amount).ok_or_else(|| {
            warn!(
                "Insufficient balance for {}: has {}, needs {}",
                from, available, amount
            );
            LedgerError::transfer_failed(format!(
                "insufficient balance: {} holds {}, needs {}",
                from, available, amount
            ))
        })?;
        let custody = state
            .custody
            .checked_add(amount)
            .ok_or_else(|| LedgerError::transfer_failed("custody overflow"))?;

        state.balances.insert(from.clone(), remaining);
        state.custody = custody;

        info!("Collected {} from {} into custody", amount, from);
        Ok(())
    }

    async fn pay(&self, to: &Identity, amount: Amount) -> LedgerResult<()> {
        let mut state = self.state.write().await;

        if state.rejected_payees.contains(to) {
            warn!("Payee {} rejected transfer of {}", to, amount);
            return Err(LedgerError::transfer_failed(format!(
                "transfer to {} rejected",
                to
            )));
        }

        let custody = state.custody.checked_sub(amount).ok_or_else(|| {
            LedgerError::transfer_failed(format!(
                "custody holds {}, cannot pay {}",
                state.custody, amount
            ))
        })?;
        let balance = state
            .balances
            .get(to)
            .copied()
            .unwrap_or_default()
            .checked_add(amount)
            .ok_or_else(|| LedgerError::transfer_failed("balance overflow"))?;

        state.custody = custody;
        state.balances.insert(to.clone(), balance);

        info!("Paid {} from custody to {}", amount, to);
        Ok(())
    }
}
