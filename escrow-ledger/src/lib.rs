//! Two-party escrow custody ledger
//!
//! A buyer deposits funds for a seller. The funds are released to the seller
//! by the buyer, or refunded to the buyer by the ledger's owning identity once
//! the escrow's deadline has passed. This crate provides:
//! - the escrow lifecycle state machine with per-record role checks
//! - a value-transfer seam for moving funds into and out of custody
//! - an append-only audit log of every committed change
//! - a node facade with configuration, health checks and a timeout sweeper

pub mod clock;
pub mod config;
pub mod custody;
pub mod error;
pub mod events;
pub mod ledger;
pub mod models;
pub mod node;

pub use error::LedgerError;

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
