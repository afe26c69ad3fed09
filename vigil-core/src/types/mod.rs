//! Core domain types shared across the engine.

mod dump;
mod finding;
mod ids;
mod replica;

pub use dump::{DumpHeader, DumpRecord, DumpSide};
pub use finding::{Finding, FindingKind};
pub use ids::{FileKey, ReplicaKey, RseId};
pub use replica::{BadReplica, Checksum, ReplicaState, SiblingReplica};
