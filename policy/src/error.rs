//! Error types for the policy core

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    /// Rule file missing or unreadable.
    #[error("rule file {} is unavailable: {source}", path.display())]
    ConfigUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to decode rule file {}: {message}", path.display())]
    ConfigInvalid { path: PathBuf, message: String },

    /// Compiler produced something no rule should be able to produce.
    #[error("compiled policy violates expansion invariant: {0}")]
    CompileInvariantViolation(String),

    #[error("chain driver failed to {operation} {table}/{chain}: {message}")]
    ChainDriver {
        operation: &'static str,
        table: String,
        chain: String,
        message: String,
    },
}

impl PolicyError {
    pub(crate) fn driver(
        operation: &'static str,
        table: &str,
        chain: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::ChainDriver {
            operation,
            table: table.to_string(),
            chain: chain.to_string(),
            message: message.into(),
        }
    }

    /// True for failures reported by the chain capability.
    pub fn is_driver_error(&self) -> bool {
        matches!(self, Self::ChainDriver { .. })
    }
}
