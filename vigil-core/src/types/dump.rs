use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::replica::Checksum;

/// Which side of the reconciliation a dump describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DumpSide {
    /// What physically exists on the RSE.
    Storage,
    /// What the catalog believes exists on the RSE.
    Catalog,
}

impl std::fmt::Display for DumpSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage => f.write_str("storage"),
            Self::Catalog => f.write_str("catalog"),
        }
    }
}

/// Provenance of one dump: where it came from and when it was captured.
///
/// `generated_at` is the capture instant of the whole listing, not of any
/// individual record; the skew guard compares these across the pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpHeader {
    pub rse: String,
    pub side: DumpSide,
    pub generated_at: DateTime<Utc>,
}

/// One record of a dump, keyed by RSE-local path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DumpRecord {
    pub path: String,
    pub bytes: Option<u64>,
    pub checksum: Option<Checksum>,
}

impl DumpRecord {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            bytes: None,
            checksum: None,
        }
    }

    pub fn with_meta(
        path: impl Into<String>,
        bytes: Option<u64>,
        checksum: Option<Checksum>,
    ) -> Self {
        Self {
            path: path.into(),
            bytes,
            checksum,
        }
    }
}
