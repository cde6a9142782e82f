//! Error types for the binding manager.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants. The public transitions on
//! [`BindingManager`](crate::BindingManager) absorb these errors and log them;
//! they surface only from the collaborator traits and the concrete store.

use std::net::IpAddr;

/// Errors that can occur while managing address bindings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (config or bindings files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) when the
    /// configuration contains invalid values (e.g., a pool whose start is
    /// after its end).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A policy value is missing or has the wrong type.
    #[error("Policy error: {0}")]
    Policy(String),

    /// A lease store mutation or query failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A DNS record deletion failed.
    ///
    /// Non-fatal to transitions unless the DDNS abort policy is set.
    #[error("DNS error: {0}")]
    Dns(String),

    /// The free-address pool rejected a reclaim.
    #[error("Pool error: {0}")]
    Pool(String),

    /// No stored binding exists for the address.
    #[error("No binding found for {0}")]
    BindingNotFound(IpAddr),

    /// The address is already bound to a different identity association.
    #[error("Address {0} is already bound to another identity")]
    AddressInUse(IpAddr),
}

/// A specialized Result type for binding operations.
pub type Result<T> = std::result::Result<T, Error>;
