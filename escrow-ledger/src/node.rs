//! Escrow Node - High-level API for the escrow ledger
//!
//! Wires an [`EscrowLedger`] to an in-memory treasury, an audit log and a
//! clock from a [`NodeConfig`], and adds the operator conveniences around
//! it: per-party listings, refunding every expired escrow in one call, an
//! optional background sweeper doing that periodically, and a custody
//! health check.

use crate::{
    clock::{Clock, SystemClock},
    config::NodeConfig,
    custody::InMemoryTreasury,
    error::LedgerError,
    events::{AuditEntry, AuditLog},
    ledger::EscrowLedger,
    models::{Amount, EscrowId, EscrowRecord, Identity},
    LedgerResult,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Escrow creation request
#[derive(Debug, Clone)]
pub struct CreateEscrowRequest {
    pub buyer: Identity,
    pub seller: Identity,
    pub deadline: DateTime<Utc>,
    pub amount: Amount,
}

/// Escrow information response
#[derive(Debug, Clone)]
pub struct EscrowInfo {
    pub record: EscrowRecord,
    pub events: Vec<AuditEntry>,
}

/// User escrows response
#[derive(Debug, Clone)]
pub struct UserEscrowsResponse {
    pub escrows: Vec<EscrowRecord>,
    pub total_count: usize,
}

/// Node health status
#[derive(Debug, Clone)]
pub struct NodeHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    /// Value the treasury holds in custody
    pub custody_balance: Amount,
    /// Value the ledger's funded records add up to
    pub ledger_custody: Amount,
    pub timestamp: DateTime<Utc>,
}

/// Main escrow node that coordinates all components
pub struct EscrowNode {
    config: NodeConfig,
    ledger: Arc<EscrowLedger>,
    treasury: Arc<InMemoryTreasury>,
    audit_log: Arc<AuditLog>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl EscrowNode {
    /// Create a node running on the system clock
    pub fn new(config: NodeConfig) -> LedgerResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a node with an explicit clock
    pub fn with_clock(config: NodeConfig, clock: Arc<dyn Clock>) -> LedgerResult<Self> {
        config.validate()?;

        info!("Initializing escrow node");

        let treasury = Arc::new(InMemoryTreasury::new());
        let audit_log = Arc::new(AuditLog::new());
        let ledger = Arc::new(EscrowLedger::new(
            config.ledger.clone(),
            treasury.clone(),
            audit_log.clone(),
            clock,
        )?);

        info!("Escrow node initialized successfully");

        Ok(Self {
            config,
            ledger,
            treasury,
            audit_log,
            sweeper: Mutex::new(None),
        })
    }

    /// Credit external funds to an identity so it can deposit
    pub async fn deposit(&self, identity: &Identity, amount: Amount) -> LedgerResult<Amount> {
        self.treasury.credit(identity, amount).await
    }

    pub async fn balance_of(&self, identity: &Identity) -> Amount {
        self.treasury.balance_of(identity).await
    }

    /// Create a new escrow
    pub async fn create_escrow(&self, request: CreateEscrowRequest) -> LedgerResult<EscrowId> {
        self.ledger
            .create_escrow(
                &request.buyer,
                &request.seller,
                request.deadline,
                request.amount,
            )
            .await
    }

    /// Buyer releases funds to the seller
    pub async fn release_funds(&self, caller: &Identity, id: EscrowId) -> LedgerResult<()> {
        self.ledger.release_funds(caller, id).await
    }

    /// Owner refunds the buyer after the deadline
    pub async fn fund_buyer(&self, caller: &Identity, id: EscrowId) -> LedgerResult<()> {
        self.ledger.fund_buyer(caller, id).await
    }

    /// Get escrow information with its audit trail
    pub async fn get_escrow_info(&self, id: EscrowId) -> LedgerResult<EscrowInfo> {
        let record = self.ledger.get_escrow(id).await?;
        let events = self.audit_log.entries_for(id).await;

        Ok(EscrowInfo { record, events })
    }

    /// Get all escrows for a user (as buyer or seller)
    pub async fn get_user_escrows(&self, identity: &Identity) -> UserEscrowsResponse {
        let escrows = self.ledger.escrows_for(identity).await;

        UserEscrowsResponse {
            total_count: escrows.len(),
            escrows,
        }
    }

    /// Refund every expired escrow; only the owner may do this
    pub async fn refund_expired(&self, caller: &Identity) -> LedgerResult<Vec<EscrowId>> {
        if !self.ledger.is_owner(caller) {
            return Err(LedgerError::unauthorized(caller, "owner"));
        }

        Ok(sweep_expired(&self.ledger, caller).await)
    }

    /// Start the background sweeper if it is enabled and not yet running
    pub async fn spawn_timeout_sweeper(&self) -> bool {
        if !self.config.sweeper.enabled {
            return false;
        }

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return false;
        }

        let handle = tokio::spawn(timeout_sweeper(
            self.ledger.clone(),
            self.config.sweeper.interval(),
        ));
        *sweeper = Some(handle);

        true
    }

    /// Live audit entries
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.audit_log.subscribe()
    }

    pub fn ledger(&self) -> &Arc<EscrowLedger> {
        &self.ledger
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit_log
    }

    pub fn treasury(&self) -> &Arc<InMemoryTreasury> {
        &self.treasury
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Health check for the escrow node
    pub async fn health_check(&self) -> NodeHealth {
        let mut issues = Vec::new();

        let custody_balance = self.treasury.custody_balance().await;
        let ledger_custody = self.ledger.custody_total().await;
        if custody_balance != ledger_custody {
            issues.push(format!(
                "Custody mismatch: treasury holds {}, ledger expects {}",
                custody_balance, ledger_custody
            ));
        }

        if let Some(handle) = self.sweeper.lock().await.as_ref() {
            if handle.is_finished() {
                issues.push("Timeout sweeper stopped unexpectedly".to_string());
            }
        }

        NodeHealth {
            healthy: issues.is_empty(),
            issues,
            custody_balance,
            ledger_custody,
            timestamp: Utc::now(),
        }
    }

    /// Shutdown the escrow node gracefully
    pub async fn shutdown(&self) {
        info!("Shutting down escrow node");

        if let Some(handle) = self.sweeper.lock().await.take() {
            handle.abort();
        }

        info!("Escrow node shutdown complete");
    }
}

/// Refund every expired escrow as `owner`, skipping records that fail
async fn sweep_expired(ledger: &EscrowLedger, owner: &Identity) -> Vec<EscrowId> {
    let mut refunded = Vec::new();

    for id in ledger.expired_escrows().await {
        match ledger.fund_buyer(owner, id).await {
            Ok(()) => refunded.push(id),
            // Released by the buyer between listing and refund
            Err(LedgerError::AlreadyResolved { .. }) => {}
            Err(e) => warn!("Could not refund expired escrow {}: {}", id, e),
        }
    }

    refunded
}

/// Background job refunding expired escrows as the owner
async fn timeout_sweeper(ledger: Arc<EscrowLedger>, interval: Duration) {
    info!("Starting timeout sweeper (every {:?})", interval);

    let owner = ledger.owner().clone();
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let refunded = sweep_expired(&ledger, &owner).await;
        if !refunded.is_empty() {
            info!("Timeout sweeper refunded {} escrows", refunded.len());
        }
    }
}
