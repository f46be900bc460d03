//! Core data models for the escrow ledger
//!
//! Identities, amounts, record identifiers and the escrow record itself,
//! together with the two-state lifecycle derived from the record flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical zero address, treated as the null identity
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

/// Base units in one whole unit of the escrowed asset
pub const UNIT: u128 = 1_000_000_000_000_000_000;

/// Opaque principal name (buyer, seller or owner)
///
/// Names are trimmed, and `0x` hex addresses are lowercased, so two spellings
/// of the same address compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(canonical_name(name.into()))
    }

    /// The null identity
    pub fn null() -> Self {
        Self(String::new())
    }

    /// Empty names and the zero address never name a real party
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == ZERO_ADDRESS
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn canonical_name(name: String) -> String {
    let trimmed = name.trim();
    let is_hex_address = trimmed
        .get(..2)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("0x"));
    if is_hex_address {
        trimmed.to_ascii_lowercase()
    } else if trimmed.len() == name.len() {
        name
    } else {
        trimmed.to_string()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<null>")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for Identity {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Identity {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.0
    }
}

/// Value in indivisible base units of the single escrowed asset
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn new(base_units: u128) -> Self {
        Self(base_units)
    }

    /// Whole units, e.g. `from_whole(1)` is 1.0
    pub const fn from_whole(units: u64) -> Self {
        Self(units as u128 * UNIT)
    }

    pub const fn base_units(&self) -> u128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u128> for Amount {
    fn from(base_units: u128) -> Self {
        Self(base_units)
    }
}

/// Escrow identifier, assigned sequentially from 0
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EscrowId(pub u64);

impl EscrowId {
    /// Position of the record in the ledger arena
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EscrowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for EscrowId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle state derived from the record flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowState {
    /// Funds held in custody, awaiting release or refund
    Funded,
    /// Funds paid out to seller or buyer
    Completed,
}

impl EscrowState {
    /// Check if this is a terminal state (no further transitions possible)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Check if this state allows release or refund
    pub fn can_resolve(&self) -> bool {
        matches!(self, Self::Funded)
    }
}

/// One escrow instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRecord {
    pub id: EscrowId,

    // Parties
    pub buyer: Identity,
    pub seller: Identity,

    // Terms
    pub amount: Amount,
    pub deadline: DateTime<Utc>,

    // Lifecycle flags, the only fields that change after creation
    pub is_funded: bool,
    pub is_completed: bool,

    pub created_at: DateTime<Utc>,
}

impl EscrowRecord {
    /// Create a freshly funded record
    pub fn new(
        id: EscrowId,
        buyer: Identity,
        seller: Identity,
        amount: Amount,
        deadline: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            buyer,
            seller,
            amount,
            deadline,
            is_funded: true,
            is_completed: false,
            created_at,
        }
    }

    pub fn state(&self) -> EscrowState {
        if self.is_completed {
            EscrowState::Completed
        } else {
            EscrowState::Funded
        }
    }

    /// Deadline has been reached at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// Funded, unresolved and past its deadline
    pub fn is_refundable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_funded && self.state().can_resolve() && self.is_expired_at(now)
    }

    pub fn involves(&self, identity: &Identity) -> bool {
        &self.buyer == identity || &self.seller == identity
    }

    /// Terminal transition: funds have left custody
    pub(crate) fn mark_resolved(&mut self) {
        self.is_funded = false;
        self.is_completed = true;
    }
}
