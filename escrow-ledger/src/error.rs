//! Error types for the escrow ledger
//!
//! Every ledger operation either succeeds completely or fails with one of
//! these errors and leaves the ledger untouched. Creation-time validation,
//! role checks, lifecycle checks and custody failures each get their own
//! variant so callers can react without parsing messages.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{EscrowId, Identity};

/// Main error type for ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Seller is null or the same identity as the buyer
    #[error("Invalid seller: {0}")]
    InvalidSeller(String),

    /// Deadline is not strictly in the future
    #[error("Invalid deadline: {0}")]
    InvalidDeadline(String),

    /// Deposit amount is zero or above the configured maximum
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// No record with this identifier
    #[error("Escrow {id} not found")]
    NotFound { id: EscrowId },

    /// Caller does not hold the role the operation requires
    #[error("Unauthorized: {caller} is not the {required}")]
    Unauthorized { caller: Identity, required: String },

    /// Record already reached its terminal state
    #[error("Escrow {id} is already resolved")]
    AlreadyResolved { id: EscrowId },

    /// Record holds no funds
    #[error("Escrow {id} is not funded")]
    NotFunded { id: EscrowId },

    /// Refund attempted before the record's deadline
    #[error("Escrow {id} deadline {deadline} not reached (now {now})")]
    DeadlineNotReached {
        id: EscrowId,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// The value-transfer primitive rejected the movement of funds
    #[error("Transfer failed: {reason}")]
    TransferFailed { reason: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LedgerError {
    /// Create an invalid seller error
    pub fn invalid_seller<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSeller(msg.into())
    }

    /// Create an invalid deadline error
    pub fn invalid_deadline<S: Into<String>>(msg: S) -> Self {
        Self::InvalidDeadline(msg.into())
    }

    /// Create an invalid amount error
    pub fn invalid_amount<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAmount(msg.into())
    }

    /// Create an unauthorized error naming the role that was required
    pub fn unauthorized<S: Into<String>>(caller: &Identity, required: S) -> Self {
        Self::Unauthorized {
            caller: caller.clone(),
            required: required.into(),
        }
    }

    /// Create a transfer failure
    pub fn transfer_failed<S: Into<String>>(reason: S) -> Self {
        Self::TransferFailed {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Stable short code for logs and audit output
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSeller(_) => "invalid_seller",
            Self::InvalidDeadline(_) => "invalid_deadline",
            Self::InvalidAmount(_) => "invalid_amount",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized { .. } => "unauthorized",
            Self::AlreadyResolved { .. } => "already_resolved",
            Self::NotFunded { .. } => "not_funded",
            Self::DeadlineNotReached { .. } => "deadline_not_reached",
            Self::TransferFailed { .. } => "transfer_failed",
            Self::Config(_) => "config",
        }
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
