use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::DumpSide;

#[derive(Error, Debug)]
pub enum VigilError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid RSE expression '{expression}': {detail}")]
    Expression { expression: String, detail: String },

    #[error(
        "Stale dump pairing for {rse}: storage dump from {storage_generated}, catalog dump from {catalog_generated}, allowed skew {delta_days} days"
    )]
    StaleDumpPair {
        rse: String,
        storage_generated: DateTime<Utc>,
        catalog_generated: DateTime<Utc>,
        delta_days: i64,
    },

    #[error("Malformed {side} dump for {rse}: {detail}")]
    MalformedDump {
        rse: String,
        side: DumpSide,
        detail: String,
    },

    #[error("No usable {side} dump for {rse}: {detail}")]
    DumpUnavailable {
        rse: String,
        side: DumpSide,
        detail: String,
    },

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Transfer submission error: {0}")]
    Transfer(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl VigilError {
    /// Whether the failure is expected to clear on its own and should be
    /// retried on the next cycle rather than escalated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Catalog(_) | Self::Transfer(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, VigilError>;
