//! Escrow Ledger - the escrow lifecycle state machine
//!
//! The ledger owns every escrow record and enforces who may move a record
//! from `Funded` to `Completed`:
//!
//! - any identity creates an escrow (and becomes its buyer) by depositing funds
//! - the buyer releases the funds to the seller at any time
//! - the owning identity refunds the buyer once the deadline has been reached
//!
//! Release and refund are mutually exclusive. Each resolution holds the
//! record's own lock across check, payout and flag flip, so concurrent
//! attempts on one record see exactly one winner while different records
//! resolve independently.

use crate::{
    clock::Clock,
    config::LedgerConfig,
    custody::ValueTransfer,
    error::LedgerError,
    events::{EventSink, LedgerEvent},
    models::{Amount, EscrowId, EscrowRecord, Identity},
    LedgerResult,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Registry of escrow records plus the custody operations that resolve them
pub struct EscrowLedger {
    /// Configuration (owner is fixed here for the ledger's lifetime)
    config: LedgerConfig,
    /// Append-only arena; a record's identifier is its index
    records: RwLock<Vec<Arc<Mutex<EscrowRecord>>>>,
    /// Moves value into and out of custody
    custody: Arc<dyn ValueTransfer>,
    /// Receives a notification for every committed change
    events: Arc<dyn EventSink>,
    /// Time source for deadline checks
    clock: Arc<dyn Clock>,
}

impl EscrowLedger {
    /// Create an empty ledger owned by `config.owner`
    pub fn new(
        config: LedgerConfig,
        custody: Arc<dyn ValueTransfer>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> LedgerResult<Self> {
        if config.owner.is_null() {
            return Err(LedgerError::config("ledger owner cannot be null"));
        }

        info!("Initializing escrow ledger owned by {}", config.owner);

        Ok(Self {
            config,
            records: RwLock::new(Vec::new()),
            custody,
            events,
            clock,
        })
    }

    /// Deposit `amount` from `caller` into a new escrow for `seller`
    pub async fn create_escrow(
        &self,
        caller: &Identity,
        seller: &Identity,
        deadline: DateTime<Utc>,
        amount: Amount,
    ) -> LedgerResult<EscrowId> {
        info!(
            "Creating escrow: buyer={}, seller={}, amount={}, deadline={}",
            caller, seller, amount, deadline
        );

        let now = self.clock.now();
        self.validate_create(caller, seller, deadline, amount, now)?;

        // Funds enter custody before an identifier is allocated, so a failed
        // deposit leaves no trace in the ledger
        self.custody
            .collect(caller, amount)
            .await
            .map_err(|e| transfer_error(e, "deposit"))?;

        let mut records = self.records.write().await;
        let id = EscrowId(records.len() as u64);
        let record = EscrowRecord::new(id, caller.clone(), seller.clone(), amount, deadline, now);
        records.push(Arc::new(Mutex::new(record)));

        // Published under the arena lock so the log lists creations in id order
        self.events
            .publish(LedgerEvent::EscrowCreated {
                id,
                buyer: caller.clone(),
                seller: seller.clone(),
                amount,
                deadline,
            })
            .await;
        self.events
            .publish(LedgerEvent::FundsDeposited { id, amount })
            .await;
        drop(records);

        info!("Created escrow: {}", id);

        Ok(id)
    }

    /// Buyer releases the escrowed funds to the seller
    pub async fn release_funds(&self, caller: &Identity, id: EscrowId) -> LedgerResult<()> {
        info!("Releasing escrow {} (caller: {})", id, caller);

        let entry = self.entry(id).await?;
        let mut record = entry.lock().await;

        if &record.buyer != caller {
            warn!("Rejected release of escrow {} by {}", id, caller);
            return Err(LedgerError::unauthorized(caller, "buyer"));
        }

        ensure_resolvable(&record)?;

        self.custody
            .pay(&record.seller, record.amount)
            .await
            .map_err(|e| transfer_error(e, "release"))?;

        record.mark_resolved();
        self.events.publish(LedgerEvent::FundsReleased { id }).await;

        info!(
            "Released escrow {}: {} paid to {}",
            id, record.amount, record.seller
        );

        Ok(())
    }

    /// Owner refunds the buyer once the deadline has been reached.
    ///
    /// This is the refund-on-timeout override; the seller's consent is not
    /// needed and the buyer cannot trigger it.
    pub async fn fund_buyer(&self, caller: &Identity, id: EscrowId) -> LedgerResult<()> {
        info!("Refunding escrow {} (caller: {})", id, caller);

        let entry = self.entry(id).await?;
        let mut record = entry.lock().await;

        if !self.is_owner(caller) {
            warn!("Rejected refund of escrow {} by {}", id, caller);
            return Err(LedgerError::unauthorized(caller, "owner"));
        }

        ensure_resolvable(&record)?;

        let now = self.clock.now();
        if !record.is_expired_at(now) {
            return Err(LedgerError::DeadlineNotReached {
                id,
                deadline: record.deadline,
                now,
            });
        }

        self.custody
            .pay(&record.buyer, record.amount)
            .await
            .map_err(|e| transfer_error(e, "refund"))?;

        record.mark_resolved();
        self.events.publish(LedgerEvent::FundsRefunded { id }).await;

        info!(
            "Refunded escrow {}: {} returned to {}",
            id, record.amount, record.buyer
        );

        Ok(())
    }

    /// Snapshot of one record
    pub async fn get_escrow(&self, id: EscrowId) -> LedgerResult<EscrowRecord> {
        let entry = self.entry(id).await?;
        let record = entry.lock().await;
        Ok(record.clone())
    }

    /// The owning identity fixed at construction
    pub fn owner(&self) -> &Identity {
        &self.config.owner
    }

    pub fn is_owner(&self, identity: &Identity) -> bool {
        &self.config.owner == identity
    }

    /// Identifier the next escrow will receive
    pub async fn escrow_count(&self) -> u64 {
        self.records.read().await.len() as u64
    }

    /// Every record, ordered by identifier
    pub async fn all_escrows(&self) -> Vec<EscrowRecord> {
        let mut escrows = Vec::new();
        for entry in self.snapshot().await {
            escrows.push(entry.lock().await.clone());
        }
        escrows
    }

    /// Records where `identity` is buyer or seller
    pub async fn escrows_for(&self, identity: &Identity) -> Vec<EscrowRecord> {
        let mut escrows = Vec::new();
        for entry in self.snapshot().await {
            let record = entry.lock().await;
            if record.involves(identity) {
                escrows.push(record.clone());
            }
        }
        escrows
    }

    /// Funded records whose deadline has been reached
    pub async fn expired_escrows(&self) -> Vec<EscrowId> {
        let now = self.clock.now();
        let mut expired = Vec::new();
        for entry in self.snapshot().await {
            let record = entry.lock().await;
            if record.is_refundable_at(now) {
                expired.push(record.id);
            }
        }
        debug!("Found {} expired escrows", expired.len());
        expired
    }

    /// Total value the ledger believes is in custody
    pub async fn custody_total(&self) -> Amount {
        let mut total: u128 = 0;
        for entry in self.snapshot().await {
            let record = entry.lock().await;
            if record.is_funded {
                total = total.saturating_add(record.amount.base_units());
            }
        }
        Amount::new(total)
    }

    async fn entry(&self, id: EscrowId) -> LedgerResult<Arc<Mutex<EscrowRecord>>> {
        self.records
            .read()
            .await
            .get(id.index())
            .cloned()
            .ok_or(LedgerError::NotFound { id })
    }

    async fn snapshot(&self) -> Vec<Arc<Mutex<EscrowRecord>>> {
        self.records.read().await.clone()
    }

    fn validate_create(
        &self,
        caller: &Identity,
        seller: &Identity,
        deadline: DateTime<Utc>,
        amount: Amount,
        now: DateTime<Utc>,
    ) -> LedgerResult<()> {
        if seller.is_null() {
            return Err(LedgerError::invalid_seller("seller cannot be null"));
        }

        if seller == caller {
            return Err(LedgerError::invalid_seller(
                "buyer and seller must be different",
            ));
        }

        if deadline <= now {
            return Err(LedgerError::invalid_deadline(format!(
                "deadline {} is not after {}",
                deadline, now
            )));
        }

        if amount.is_zero() {
            return Err(LedgerError::invalid_amount("amount must be greater than 0"));
        }

        if let Some(max) = self.config.max_amount {
            if amount > max {
                return Err(LedgerError::invalid_amount(format!(
                    "amount {} exceeds maximum {}",
                    amount, max
                )));
            }
        }

        Ok(())
    }
}

/// Lifecycle guard shared by release and refund
fn ensure_resolvable(record: &EscrowRecord) -> LedgerResult<()> {
    if record.state().is_terminal() {
        return Err(LedgerError::AlreadyResolved { id: record.id });
    }

    if !record.is_funded {
        return Err(LedgerError::NotFunded { id: record.id });
    }

    Ok(())
}

fn transfer_error(err: LedgerError, operation: &str) -> LedgerError {
    warn!("Custody {} failed: {}", operation, err);
    match err {
        LedgerError::TransferFailed { .. } => err,
        other => LedgerError::transfer_failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, custody::InMemoryTreasury, events::AuditLog};
    use chrono::Duration;

    struct TestLedger {
        ledger: EscrowLedger,
        treasury: Arc<InMemoryTreasury>,
        log: Arc<AuditLog>,
        clock: Arc<ManualClock>,
        owner: Identity,
        buyer: Identity,
        seller: Identity,
    }

    async fn setup() -> TestLedger {
        let owner = Identity::from("owner");
        let buyer = Identity::from("buyer");
        let seller = Identity::from("seller");

        let treasury = Arc::new(InMemoryTreasury::new());
        treasury.credit(&buyer, Amount::new(1_000)).await.unwrap();
        let log = Arc::new(AuditLog::new());
        let clock = Arc::new(ManualClock::starting_now());

        let config = LedgerConfig {
            owner: owner.clone(),
            max_amount: None,
        };
        let ledger =
            EscrowLedger::new(config, treasury.clone(), log.clone(), clock.clone()).unwrap();

        TestLedger {
            ledger,
            treasury,
            log,
            clock,
            owner,
            buyer,
            seller,
        }
    }

    async fn create_test_escrow(t: &TestLedger) -> EscrowId {
        let deadline = t.clock.now() + Duration::hours(1);
        t.ledger
            .create_escrow(&t.buyer, &t.seller, deadline, Amount::new(100))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_null_owner_rejected() {
        let result = EscrowLedger::new(
            LedgerConfig {
                owner: Identity::null(),
                max_amount: None,
            },
            Arc::new(InMemoryTreasury::new()),
            Arc::new(AuditLog::new()),
            Arc::new(ManualClock::starting_now()),
        );
        assert!(matches!(result, Err(LedgerError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_escrow_success() {
        let t = setup().await;
        let deadline = t.clock.now() + Duration::hours(1);

        let id = t
            .ledger
            .create_escrow(&t.buyer, &t.seller, deadline, Amount::new(100))
            .await
            .unwrap();
        assert_eq!(id, EscrowId(0));

        let record = t.ledger.get_escrow(id).await.unwrap();
        assert_eq!(record.buyer, t.buyer);
        assert_eq!(record.seller, t.seller);
        assert_eq!(record.amount, Amount::new(100));
        assert_eq!(record.deadline, deadline);
        assert!(record.is_funded);
        assert!(!record.is_completed);

        assert_eq!(t.treasury.balance_of(&t.buyer).await, Amount::new(900));
        assert_eq!(t.treasury.custody_balance().await, Amount::new(100));
        assert_eq!(t.ledger.custody_total().await, Amount::new(100));
    }

    #[tokio::test]
    async fn test_identifiers_are_sequential() {
        let t = setup().await;
        for expected in 0..3 {
            assert_eq!(create_test_escrow(&t).await, EscrowId(expected));
        }
        assert_eq!(t.ledger.escrow_count().await, 3);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_seller() {
        let t = setup().await;
        let deadline = t.clock.now() + Duration::hours(1);

        let result = t
            .ledger
            .create_escrow(&t.buyer, &Identity::null(), deadline, Amount::new(1))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidSeller(_))));

        let result = t
            .ledger
            .create_escrow(&t.buyer, &t.buyer, deadline, Amount::new(1))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidSeller(_))));
        assert_eq!(t.ledger.escrow_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_rejects_seller_spelled_as_buyer_address() {
        let t = setup().await;
        let buyer = Identity::from("0xAbCdEf0000000000000000000000000000000001");
        t.treasury.credit(&buyer, Amount::new(10)).await.unwrap();
        let deadline = t.clock.now() + Duration::hours(1);

        let seller = Identity::from("0xabcdef0000000000000000000000000000000001");
        let result = t
            .ledger
            .create_escrow(&buyer, &seller, deadline, Amount::new(1))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidSeller(_))));

        let result = t
            .ledger
            .create_escrow(
                &buyer,
                &Identity::from("0X0000000000000000000000000000000000000000"),
                deadline,
                Amount::new(1),
            )
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidSeller(_))));
        assert_eq!(t.treasury.balance_of(&buyer).await, Amount::new(10));
    }

    #[tokio::test]
    async fn test_create_rejects_past_or_present_deadline() {
        let t = setup().await;
        let now = t.clock.now();

        for deadline in [now, now - Duration::seconds(10)] {
            let result = t
                .ledger
                .create_escrow(&t.buyer, &t.seller, deadline, Amount::new(1))
                .await;
            assert!(matches!(result, Err(LedgerError::InvalidDeadline(_))));
        }
        assert_eq!(t.treasury.custody_balance().await, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_create_rejects_zero_amount() {
        let t = setup().await;
        let deadline = t.clock.now() + Duration::hours(1);
        let result = t
            .ledger
            .create_escrow(&t.buyer, &t.seller, deadline, Amount::ZERO)
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_create_rejects_amount_above_maximum() {
        let treasury = Arc::new(InMemoryTreasury::new());
        let buyer = Identity::from("buyer");
        treasury.credit(&buyer, Amount::new(1_000)).await.unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let ledger = EscrowLedger::new(
            LedgerConfig {
                owner: Identity::from("owner"),
                max_amount: Some(Amount::new(50)),
            },
            treasury,
            Arc::new(AuditLog::new()),
            clock.clone(),
        )
        .unwrap();

        let result = ledger
            .create_escrow(
                &buyer,
                &Identity::from("seller"),
                clock.now() + Duration::hours(1),
                Amount::new(51),
            )
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_failed_deposit_consumes_no_identifier() {
        let t = setup().await;
        let deadline = t.clock.now() + Duration::hours(1);

        let result = t
            .ledger
            .create_escrow(&t.buyer, &t.seller, deadline, Amount::new(5_000))
            .await;
        assert!(matches!(result, Err(LedgerError::TransferFailed { .. })));
        assert_eq!(t.ledger.escrow_count().await, 0);
        assert!(t.log.is_empty().await);

        assert_eq!(create_test_escrow(&t).await, EscrowId(0));
    }

    #[tokio::test]
    async fn test_release_funds_pays_seller() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.ledger.release_funds(&t.buyer, id).await.unwrap();

        let record = t.ledger.get_escrow(id).await.unwrap();
        assert!(!record.is_funded);
        assert!(record.is_completed);
        assert_eq!(t.treasury.balance_of(&t.seller).await, Amount::new(100));
        assert_eq!(t.treasury.custody_balance().await, Amount::ZERO);
    }

    #[tokio::test]
    async fn test_release_requires_buyer() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        for caller in [&t.seller, &t.owner, &Identity::from("stranger")] {
            let result = t.ledger.release_funds(caller, id).await;
            assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
        }

        let record = t.ledger.get_escrow(id).await.unwrap();
        assert!(record.is_funded);
        assert!(!record.is_completed);
    }

    #[tokio::test]
    async fn test_release_unknown_escrow() {
        let t = setup().await;
        let result = t.ledger.release_funds(&t.buyer, EscrowId(999)).await;
        assert!(matches!(
            result,
            Err(LedgerError::NotFound { id: EscrowId(999) })
        ));
    }

    #[tokio::test]
    async fn test_release_twice() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.ledger.release_funds(&t.buyer, id).await.unwrap();
        let result = t.ledger.release_funds(&t.buyer, id).await;
        assert!(matches!(result, Err(LedgerError::AlreadyResolved { .. })));
        assert_eq!(t.treasury.balance_of(&t.seller).await, Amount::new(100));
    }

    #[tokio::test]
    async fn test_refund_before_deadline() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.clock.advance(Duration::minutes(59));
        let result = t.ledger.fund_buyer(&t.owner, id).await;
        assert!(matches!(result, Err(LedgerError::DeadlineNotReached { .. })));
    }

    #[tokio::test]
    async fn test_refund_at_deadline() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.clock.advance(Duration::hours(1));
        t.ledger.fund_buyer(&t.owner, id).await.unwrap();

        let record = t.ledger.get_escrow(id).await.unwrap();
        assert!(record.is_completed);
        assert_eq!(t.treasury.balance_of(&t.buyer).await, Amount::new(1_000));
    }

    #[tokio::test]
    async fn test_refund_requires_owner() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;
        t.clock.advance(Duration::hours(2));

        for caller in [&t.buyer, &t.seller] {
            let result = t.ledger.fund_buyer(caller, id).await;
            assert!(matches!(result, Err(LedgerError::Unauthorized { .. })));
        }
    }

    #[tokio::test]
    async fn test_refund_after_release() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.ledger.release_funds(&t.buyer, id).await.unwrap();
        t.clock.advance(Duration::hours(2));

        let result = t.ledger.fund_buyer(&t.owner, id).await;
        assert!(matches!(result, Err(LedgerError::AlreadyResolved { .. })));
    }

    #[tokio::test]
    async fn test_release_after_refund() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.clock.advance(Duration::hours(2));
        t.ledger.fund_buyer(&t.owner, id).await.unwrap();

        let result = t.ledger.release_funds(&t.buyer, id).await;
        assert!(matches!(result, Err(LedgerError::AlreadyResolved { .. })));
    }

    #[tokio::test]
    async fn test_rejected_payout_leaves_record_funded() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;

        t.treasury.reject_payments_to(&t.seller).await;
        let result = t.ledger.release_funds(&t.buyer, id).await;
        assert!(matches!(result, Err(LedgerError::TransferFailed { .. })));

        let record = t.ledger.get_escrow(id).await.unwrap();
        assert!(record.is_funded);
        assert!(!record.is_completed);
        assert_eq!(t.log.entries_for(id).await.len(), 2);

        t.treasury.accept_payments_to(&t.seller).await;
        t.ledger.release_funds(&t.buyer, id).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_refund_leaves_record_funded() {
        let t = setup().await;
        let id = create_test_escrow(&t).await;
        t.clock.advance(Duration::hours(2));

        t.treasury.reject_payments_to(&t.buyer).await;
        let result = t.ledger.fund_buyer(&t.owner, id).await;
        assert!(matches!(result, Err(LedgerError::TransferFailed { .. })));

        let record = t.ledger.get_escrow(id).await.unwrap();
        assert!(record.is_funded);
        assert!(!record.is_completed);
        assert_eq!(t.treasury.balance_of(&t.buyer).await, Amount::new(900));
        assert_eq!(t.treasury.custody_balance().await, Amount::new(100));
        assert!(!t
            .log
            .events()
            .await
            .iter()
            .any(|event| matches!(event, LedgerEvent::FundsRefunded { .. })));
        assert_eq!(t.ledger.expired_escrows().await, vec![id]);

        t.treasury.accept_payments_to(&t.buyer).await;
        t.ledger.fund_buyer(&t.owner, id).await.unwrap();
        assert_eq!(t.treasury.balance_of(&t.buyer).await, Amount::new(1_000));
    }

    #[tokio::test]
    async fn test_listings() {
        let t = setup().await;
        let first = create_test_escrow(&t).await;

        let deadline = t.clock.now() + Duration::hours(3);
        let other_seller = Identity::from("other");
        let second = t
            .ledger
            .create_escrow(&t.buyer, &other_seller, deadline, Amount::new(10))
            .await
            .unwrap();

        assert_eq!(t.ledger.escrows_for(&t.buyer).await.len(), 2);
        let for_seller = t.ledger.escrows_for(&t.seller).await;
        assert_eq!(for_seller.len(), 1);
        assert_eq!(for_seller[0].id, first);

        t.clock.advance(Duration::hours(2));
        assert_eq!(t.ledger.expired_escrows().await, vec![first]);

        t.clock.advance(Duration::hours(1));
        assert_eq!(t.ledger.expired_escrows().await, vec![first, second]);
        assert_eq!(t.ledger.all_escrows().await.len(), 2);
    }

    #[tokio::test]
    async fn test_owner_accessor() {
        let t = setup().await;
        assert_eq!(t.ledger.owner(), &t.owner);
        assert!(t.ledger.is_owner(&t.owner));
        assert!(!t.ledger.is_owner(&t.buyer));
    }
}
