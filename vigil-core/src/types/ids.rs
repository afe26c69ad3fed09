use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly typed ID for a storage element (RSE).
#[derive(
    Debug,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Copy,
)]
pub struct RseId(pub Uuid);

impl Default for RseId {
    fn default() -> Self {
        Self::new()
    }
}

impl RseId {
    pub fn new() -> Self {
        RseId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for RseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical file identity in the catalog.
///
/// Two replicas of the same file share a `FileKey`; the catalog owns the
/// mapping from key to known replica locations. The engine never fabricates
/// keys, it only carries them between the catalog and the storage side.
#[derive(
    Debug,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct FileKey {
    pub scope: String,
    pub name: String,
}

impl FileKey {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

/// Identity of one physical replica: a logical file pinned to one RSE.
///
/// The ordering (scope, name, rse id) is what batch cursors advance over, so
/// replicas of the same file are always adjacent in cursor order.
#[derive(
    Debug,
    Clone,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
pub struct ReplicaKey {
    pub file: FileKey,
    pub rse_id: RseId,
}

impl ReplicaKey {
    pub fn new(file: FileKey, rse_id: RseId) -> Self {
        Self { file, rse_id }
    }
}

impl std::fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.file, self.rse_id)
    }
}
