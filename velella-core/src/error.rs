//! Structured error types for the velella engine.

use thiserror::Error;

/// Unified error type for all velella operations.
///
/// Every error is fatal to an MCMC run: the driver either rejects the
/// offending proposal (out-of-bounds virtual rates) or aborts. There is no
/// local recovery.
#[derive(Debug, Error)]
pub enum VelellaError {
    /// Missing or invalid configuration option
    #[error("config error: {0}")]
    Config(String),

    /// Malformed input data (unknown state symbol, inconsistent gap masks,
    /// non-constant SITE_STATIC column)
    #[error("schema error: {0}")]
    Schema(String),

    /// Structural failure (missing tip sequence, no rate vector for a
    /// reachable context)
    #[error("graph error: {0}")]
    Graph(String),

    /// Numeric failure (NaN likelihood, rate outside [0, 1])
    #[error("numeric error: {0}")]
    Numeric(String),

    /// I/O error (file open, write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error (malformed raw input)
    #[error("parse error: {0}")]
    Parse(String),
}

/// Convenience alias used throughout the velella crates.
pub type Result<T> = std::result::Result<T, VelellaError>;
