//! Transfer submission port.
//!
//! Repair transfers carry a deterministic request id derived from the bad
//! replica's identity and bad-declaration time, so a crashed daemon that
//! re-plans the same replica collapses onto the original request instead of
//! submitting twice.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{BadReplica, Checksum, FileKey, RseId, SiblingReplica};

/// Namespace for v5 request ids. Changing this invalidates dedup across
/// versions, so it is fixed forever.
const REQUEST_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_89ab_44d1_4f02_9d3e_5a70_c2b4_e817);

/// One repair transfer: copy the file from a surviving replica onto the RSE
/// holding the damaged one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferRequest {
    pub request_id: Uuid,
    pub file: FileKey,
    pub dest_rse_id: RseId,
    pub dest_rse: String,
    pub source_rse_id: RseId,
    pub source_rse: String,
    pub bytes: Option<u64>,
    pub checksum: Option<Checksum>,
}

impl TransferRequest {
    pub fn repair(replica: &BadReplica, source: &SiblingReplica) -> Self {
        let seed = format!(
            "{}:{}:{}:{}",
            replica.key.file.scope,
            replica.key.file.name,
            replica.key.rse_id,
            replica.declared_at.timestamp_micros(),
        );
        Self {
            request_id: Uuid::new_v5(&REQUEST_NAMESPACE, seed.as_bytes()),
            file: replica.key.file.clone(),
            dest_rse_id: replica.key.rse_id,
            dest_rse: replica.rse.clone(),
            source_rse_id: source.rse_id,
            source_rse: source.rse.clone(),
            bytes: replica.bytes,
            checksum: replica.checksum.clone(),
        }
    }
}

#[async_trait]
pub trait TransferSubmitter: Send + Sync {
    /// Submit a repair transfer. Returns `false` when a request with the
    /// same id was already accepted.
    async fn submit(&self, request: &TransferRequest) -> Result<bool>;
}

/// Submitter that records requests in memory, deduplicating on request id.
/// Backs tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingSubmitter {
    requests: Mutex<Vec<TransferRequest>>,
}

impl RecordingSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted(&self) -> Vec<TransferRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TransferSubmitter for RecordingSubmitter {
    async fn submit(&self, request: &TransferRequest) -> Result<bool> {
        let mut requests = self.requests.lock();
        if requests.iter().any(|r| r.request_id == request.request_id) {
            return Ok(false);
        }
        requests.push(request.clone());
        Ok(true)
    }
}

/// Durable submitter handing requests to the transfer subsystem through its
/// Postgres queue table.
#[cfg(feature = "postgres")]
pub mod postgres {
    use sqlx::postgres::PgPool;
    use tracing::info;

    use super::{TransferRequest, TransferSubmitter};
    use crate::error::{Result, VigilError};

    #[derive(Debug, Clone)]
    pub struct PgTransferQueue {
        pool: PgPool,
    }

    impl PgTransferQueue {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }

        pub async fn initialize_schema(&self) -> Result<()> {
            info!("initializing transfer queue schema");
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS transfer_requests (
                    request_id UUID PRIMARY KEY,
                    scope TEXT NOT NULL,
                    name TEXT NOT NULL,
                    dest_rse_id UUID NOT NULL,
                    dest_rse TEXT NOT NULL,
                    source_rse_id UUID NOT NULL,
                    source_rse TEXT NOT NULL,
                    bytes BIGINT,
                    checksum TEXT,
                    submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            )
            .execute(&self.pool)
            .await
            .map_err(|e| {
                VigilError::Transfer(format!("cannot create transfer_requests: {e}"))
            })?;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl TransferSubmitter for PgTransferQueue {
        async fn submit(&self, request: &TransferRequest) -> Result<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO transfer_requests (
                    request_id, scope, name, dest_rse_id, dest_rse,
                    source_rse_id, source_rse, bytes, checksum
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (request_id) DO NOTHING
                "#,
            )
            .bind(request.request_id)
            .bind(&request.file.scope)
            .bind(&request.file.name)
            .bind(request.dest_rse_id.as_uuid())
            .bind(&request.dest_rse)
            .bind(request.source_rse_id.as_uuid())
            .bind(&request.source_rse)
            .bind(request.bytes.map(|b| b as i64))
            .bind(request.checksum.as_ref().map(|c| c.0.as_str()))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                VigilError::Transfer(format!("transfer submission failed: {e}"))
            })?;
            Ok(result.rows_affected() > 0)
        }
    }
}

#[cfg(feature = "postgres")]
pub use postgres::PgTransferQueue;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReplicaKey, ReplicaState};
    use chrono::{TimeZone, Utc};

    fn bad_replica(declared_micros: i64) -> BadReplica {
        BadReplica {
            key: ReplicaKey::new(
                FileKey::new("data", "run1234.root"),
                RseId(Uuid::from_u128(7)),
            ),
            rse: "DESY_DATADISK".to_string(),
            state: ReplicaState::Bad,
            bytes: Some(1024),
            checksum: Some(Checksum::new("ad:1f2e3d4c")),
            reason: "checksum mismatch".to_string(),
            declared_at: Utc.timestamp_micros(declared_micros).unwrap(),
            recovering_since: None,
        }
    }

    fn sibling() -> SiblingReplica {
        SiblingReplica {
            rse_id: RseId(Uuid::from_u128(8)),
            rse: "CERN_DATADISK".to_string(),
            state: ReplicaState::Available,
            recovering_since: None,
        }
    }

    #[test]
    fn request_id_is_deterministic() {
        let a = TransferRequest::repair(&bad_replica(1_000), &sibling());
        let b = TransferRequest::repair(&bad_replica(1_000), &sibling());
        assert_eq!(a.request_id, b.request_id);

        // A later re-declaration is a new incident, not the same request.
        let c = TransferRequest::repair(&bad_replica(2_000), &sibling());
        assert_ne!(a.request_id, c.request_id);
    }

    #[tokio::test]
    async fn recording_submitter_collapses_duplicates() {
        let submitter = RecordingSubmitter::new();
        let request = TransferRequest::repair(&bad_replica(1_000), &sibling());

        assert!(submitter.submit(&request).await.unwrap());
        assert!(!submitter.submit(&request).await.unwrap());
        assert_eq!(submitter.submitted().len(), 1);
    }
}
