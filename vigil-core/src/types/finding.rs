use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ids::{FileKey, RseId};
use crate::types::replica::Checksum;

/// Classification of an inconsistency between storage and catalog.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum FindingKind {
    /// Physically present on storage, unknown to the catalog.
    Dark,
    /// Known to the catalog, absent from storage.
    Lost,
    /// Present on both sides with mismatching size or checksum. Treated like
    /// Lost for recovery purposes, kept distinct for reporting.
    Corrupt,
}

impl FindingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dark => "DARK",
            Self::Lost => "LOST",
            Self::Corrupt => "CORRUPT",
        }
    }
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reconciliation finding for one RSE-local path.
///
/// Findings are write-once per `(path, rse, storage generation)`: replaying
/// the same dump pair must not create a second copy, and a newer generation's
/// findings supersede rather than mutate older ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub rse_id: RseId,
    pub rse: String,
    pub path: String,
    /// Logical identity, when the path maps back to a catalog key.
    pub key: Option<FileKey>,
    pub kind: FindingKind,
    pub bytes_on_storage: Option<u64>,
    pub bytes_in_catalog: Option<u64>,
    pub checksum_on_storage: Option<Checksum>,
    pub checksum_in_catalog: Option<Checksum>,
    /// Generation timestamps of the dump pair the finding was derived from,
    /// kept for the audit trail and for generation-ordered consumption.
    pub storage_generated_at: DateTime<Utc>,
    pub catalog_generated_at: DateTime<Utc>,
}

impl Finding {
    /// The write-once identity of this finding.
    pub fn dedup_key(&self) -> (RseId, &str, DateTime<Utc>) {
        (self.rse_id, self.path.as_str(), self.storage_generated_at)
    }
}
