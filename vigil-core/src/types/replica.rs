use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::VigilError;
use crate::types::ids::{ReplicaKey, RseId};

/// Replica lifecycle states as the catalog tracks them.
///
/// The engine only ever drives the Bad → Recovering → Repaired and
/// Bad → Lost transitions; the remaining states are owned by external
/// detectors and the transfer system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaState {
    Available,
    #[serde(rename = "TEMPORARY_UNAVAILABLE")]
    TemporarilyUnavailable,
    Bad,
    Recovering,
    Repaired,
    Lost,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::TemporarilyUnavailable => "TEMPORARY_UNAVAILABLE",
            Self::Bad => "BAD",
            Self::Recovering => "RECOVERING",
            Self::Repaired => "REPAIRED",
            Self::Lost => "LOST",
        }
    }

    /// Whether a sibling in this state can serve as a repair source.
    pub fn is_repair_source(&self) -> bool {
        matches!(
            self,
            Self::Available | Self::TemporarilyUnavailable | Self::Repaired
        )
    }
}

impl std::str::FromStr for ReplicaState {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(Self::Available),
            "TEMPORARY_UNAVAILABLE" => Ok(Self::TemporarilyUnavailable),
            "BAD" => Ok(Self::Bad),
            "RECOVERING" => Ok(Self::Recovering),
            "REPAIRED" => Ok(Self::Repaired),
            "LOST" => Ok(Self::Lost),
            other => Err(VigilError::Internal(format!(
                "unknown replica state '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksum as the storage fabric reports it (algorithm-prefixed or bare hex).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Checksum(pub String);

impl Checksum {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One replica flagged as damaged, as pulled from the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BadReplica {
    pub key: ReplicaKey,
    /// RSE name, carried for logging; `key.rse_id` stays authoritative.
    pub rse: String,
    pub state: ReplicaState,
    pub bytes: Option<u64>,
    pub checksum: Option<Checksum>,
    pub reason: String,
    /// When the replica was declared bad.
    pub declared_at: DateTime<Utc>,
    /// Set while a repair transfer is in flight.
    pub recovering_since: Option<DateTime<Utc>>,
}

/// State of one sibling replica of the same logical file, in the catalog's
/// canonical listing order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiblingReplica {
    pub rse_id: RseId,
    pub rse: String,
    pub state: ReplicaState,
    pub recovering_since: Option<DateTime<Utc>>,
}
