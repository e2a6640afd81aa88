//! Error types for Registrar
//!
//! This module defines all error types used by the registration lifecycle.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! Only construction-time errors (`StoreUnavailable`, `Serialization`,
//! `InvalidConfig`) and `AlreadyRegistered` ever reach a caller. The
//! store-operation variants are produced inside the heartbeat loop, logged,
//! and counted in `HeartbeatStats`.

use thiserror::Error;

use crate::store::LeaseId;

/// The primary error type for Registrar operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The coordination store could not be reached at construction time
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration is missing or malformed (empty service name, bad TTL, etc.)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Node data could not be encoded, or a config file could not be decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Standard I/O errors (config file access)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The store refused or failed to grant a lease
    #[error("Lease grant failed: {0}")]
    LeaseGrantFailed(String),

    /// Writing the registration key failed
    #[error("Write of key '{key}' failed: {reason}")]
    WriteFailed { key: String, reason: String },

    /// A single keep-alive round-trip failed
    #[error("Renewal of lease {lease} failed: {reason}")]
    RenewalFailed { lease: LeaseId, reason: String },

    /// The store no longer knows the lease (expired or revoked)
    #[error("Lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// Deleting the registration key failed
    #[error("Delete of key '{key}' failed: {reason}")]
    DeleteFailed { key: String, reason: String },

    /// `register` was called on a handle whose heartbeat loop already ran
    #[error("Registration '{0}' is already running or finished")]
    AlreadyRegistered(String),
}

impl RegistryError {
    /// Whether the error means the store has discarded the lease.
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, RegistryError::LeaseNotFound(_))
    }
}

/// A specialized `Result` type for Registrar operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
