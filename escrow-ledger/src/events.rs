//! Ledger notifications and the append-only audit log
//!
//! Every committed state change produces one or more [`LedgerEvent`]s that
//! are handed to an [`EventSink`]. Notifications are separate from operation
//! return values so observers can rebuild history from the log alone.

use crate::models::{Amount, EscrowId, Identity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::info;
use uuid::Uuid;

/// Live subscribers lagging further than this lose the oldest entries
const SUBSCRIBER_CAPACITY: usize = 256;

/// Notification emitted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerEvent {
    EscrowCreated {
        id: EscrowId,
        buyer: Identity,
        seller: Identity,
        amount: Amount,
        deadline: DateTime<Utc>,
    },
    FundsDeposited {
        id: EscrowId,
        amount: Amount,
    },
    FundsReleased {
        id: EscrowId,
    },
    FundsRefunded {
        id: EscrowId,
    },
}

impl LedgerEvent {
    pub fn escrow_id(&self) -> EscrowId {
        match self {
            Self::EscrowCreated { id, .. }
            | Self::FundsDeposited { id, .. }
            | Self::FundsReleased { id }
            | Self::FundsRefunded { id } => *id,
        }
    }

    pub fn kind(&self) -> LedgerEventKind {
        match self {
            Self::EscrowCreated { .. } => LedgerEventKind::EscrowCreated,
            Self::FundsDeposited { .. } => LedgerEventKind::FundsDeposited,
            Self::FundsReleased { .. } => LedgerEventKind::FundsReleased,
            Self::FundsRefunded { .. } => LedgerEventKind::FundsRefunded,
        }
    }
}

/// Event kinds, named as they appear in the audit output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerEventKind {
    EscrowCreated,
    FundsDeposited,
    FundsReleased,
    FundsRefunded,
}

impl LedgerEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EscrowCreated => "EscrowCreated",
            Self::FundsDeposited => "FundsDeposited",
            Self::FundsReleased => "FundsReleased",
            Self::FundsRefunded => "FundsRefunded",
        }
    }
}

/// Receiver of ledger notifications
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Called after the state change is committed; cannot fail the operation
    async fn publish(&self, event: LedgerEvent);
}

/// One recorded notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub sequence: u64,
    pub event: LedgerEvent,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only event log with live subscription
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    subscribers: broadcast::Sender<AuditEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        let (subscribers, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            entries: RwLock::new(Vec::new()),
            subscribers,
        }
    }

    /// All entries in publication order
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    /// Entries for one escrow record
    pub async fn entries_for(&self, id: EscrowId) -> Vec<AuditEntry> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| entry.event.escrow_id() == id)
            .cloned()
            .collect()
    }

    /// Just the events, in order
    pub async fn events(&self) -> Vec<LedgerEvent> {
        self.entries
            .read()
            .await
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Receive entries published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEntry> {
        self.subscribers.subscribe()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for AuditLog {
    async fn publish(&self, event: LedgerEvent) {
        let mut entries = self.entries.write().await;
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            sequence: entries.len() as u64,
            event,
            recorded_at: Utc::now(),
        };

        info!(
            "Ledger event #{}: kind={}, escrow={}",
            entry.sequence,
            entry.event.kind().as_str(),
            entry.event.escrow_id()
        );

        entries.push(entry.clone());
        // No receivers is not an error
        let _ = self.subscribers.send(entry);
    }
}
