//! Side-effect execution for recovery decisions.
//!
//! The executor is the only place planner decisions touch the catalog and
//! the transfer system. Each item is applied all-or-nothing: a failed
//! submission leaves the replica Bad for the next cycle, and a submission
//! that lands without the state transition is reconciled by the request id
//! collapsing on resubmit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::catalog::ReplicaCatalog;
use crate::error::Result;
use crate::recovery::RecoveryDecision;
use crate::transfer::{TransferRequest, TransferSubmitter};
use crate::types::BadReplica;

/// What actually happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Repair transfer accepted (or collapsed onto an in-flight request) and
    /// the replica marked Recovering.
    RepairUnderway { newly_submitted: bool },
    /// Replica declared lost. `newly_declared` is false when it already was.
    Lost { newly_declared: bool },
    /// Nothing to do this cycle.
    Deferred,
}

pub struct ActionExecutor {
    catalog: Arc<dyn ReplicaCatalog>,
    transfers: Arc<dyn TransferSubmitter>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor").finish_non_exhaustive()
    }
}

impl ActionExecutor {
    pub fn new(catalog: Arc<dyn ReplicaCatalog>, transfers: Arc<dyn TransferSubmitter>) -> Self {
        Self { catalog, transfers }
    }

    pub async fn execute(
        &self,
        item: &BadReplica,
        decision: &RecoveryDecision,
        now: DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        match decision {
            RecoveryDecision::Defer => Ok(ActionOutcome::Deferred),
            RecoveryDecision::DeclareLost => {
                let newly_declared = self.catalog.mark_lost(&item.key).await?;
                if newly_declared {
                    info!(replica = %item.key, "no recovery source remains, declared lost");
                }
                Ok(ActionOutcome::Lost { newly_declared })
            }
            RecoveryDecision::Repair { source } => {
                let request = TransferRequest::repair(item, source);
                let newly_submitted = self.transfers.submit(&request).await?;
                if newly_submitted {
                    info!(
                        replica = %item.key,
                        source = %source.rse,
                        request = %request.request_id,
                        "repair transfer submitted"
                    );
                }
                let marked = self.catalog.mark_recovering(&item.key, now).await?;
                if !marked {
                    debug!(replica = %item.key, "state moved on before recovery could be marked");
                }
                Ok(ActionOutcome::RepairUnderway { newly_submitted })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use mockall::mock;
    use uuid::Uuid;

    use crate::catalog::MemoryCatalog;
    use crate::error::VigilError;
    use crate::transfer::RecordingSubmitter;
    use crate::types::{Checksum, FileKey, ReplicaKey, ReplicaState, RseId, SiblingReplica};

    mock! {
        Submitter {}

        #[async_trait::async_trait]
        impl TransferSubmitter for Submitter {
            async fn submit(&self, request: &TransferRequest) -> Result<bool>;
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    fn seeded_item(catalog: &MemoryCatalog) -> BadReplica {
        let rse_id = RseId(Uuid::from_u128(1));
        let key = ReplicaKey::new(FileKey::new("data", "f1.root"), rse_id);
        catalog.insert_replica(
            key.clone(),
            "SITE_BAD",
            ReplicaState::Bad,
            Some(1024),
            Some(Checksum::new("ad:1234")),
            "checksum mismatch",
            now() - Duration::hours(1),
        );
        BadReplica {
            key,
            rse: "SITE_BAD".to_string(),
            state: ReplicaState::Bad,
            bytes: Some(1024),
            checksum: Some(Checksum::new("ad:1234")),
            reason: "checksum mismatch".to_string(),
            declared_at: now() - Duration::hours(1),
            recovering_since: None,
        }
    }

    fn healthy_source() -> SiblingReplica {
        SiblingReplica {
            rse_id: RseId(Uuid::from_u128(2)),
            rse: "SITE_OK".to_string(),
            state: ReplicaState::Available,
            recovering_since: None,
        }
    }

    #[tokio::test]
    async fn repair_submits_then_marks_recovering() {
        let catalog = Arc::new(MemoryCatalog::new());
        let submitter = Arc::new(RecordingSubmitter::new());
        let item = seeded_item(&catalog);
        let executor = ActionExecutor::new(catalog.clone(), submitter.clone());

        let decision = RecoveryDecision::Repair {
            source: healthy_source(),
        };
        let outcome = executor.execute(&item, &decision, now()).await.unwrap();
        assert_eq!(
            outcome,
            ActionOutcome::RepairUnderway {
                newly_submitted: true
            }
        );
        assert_eq!(
            catalog.replica_state(&item.key),
            Some(ReplicaState::Recovering)
        );

        let submitted = submitter.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].dest_rse_id, item.key.rse_id);
        assert_eq!(submitted[0].source_rse, "SITE_OK");
    }

    #[tokio::test]
    async fn replayed_repair_collapses_to_one_request() {
        let catalog = Arc::new(MemoryCatalog::new());
        let submitter = Arc::new(RecordingSubmitter::new());
        let item = seeded_item(&catalog);
        let executor = ActionExecutor::new(catalog.clone(), submitter.clone());
        let decision = RecoveryDecision::Repair {
            source: healthy_source(),
        };

        let first = executor.execute(&item, &decision, now()).await.unwrap();
        let second = executor.execute(&item, &decision, now()).await.unwrap();
        assert_eq!(
            first,
            ActionOutcome::RepairUnderway {
                newly_submitted: true
            }
        );
        assert_eq!(
            second,
            ActionOutcome::RepairUnderway {
                newly_submitted: false
            }
        );
        assert_eq!(submitter.submitted().len(), 1);
    }

    #[tokio::test]
    async fn failed_submission_leaves_the_replica_bad() {
        let catalog = Arc::new(MemoryCatalog::new());
        let item = seeded_item(&catalog);

        let mut submitter = MockSubmitter::new();
        submitter
            .expect_submit()
            .returning(|_| Err(VigilError::Transfer("queue unreachable".to_string())));

        let executor = ActionExecutor::new(catalog.clone(), Arc::new(submitter));
        let decision = RecoveryDecision::Repair {
            source: healthy_source(),
        };
        let err = executor.execute(&item, &decision, now()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(catalog.replica_state(&item.key), Some(ReplicaState::Bad));
    }

    #[tokio::test]
    async fn declare_lost_is_idempotent() {
        let catalog = Arc::new(MemoryCatalog::new());
        let submitter = Arc::new(RecordingSubmitter::new());
        let item = seeded_item(&catalog);
        let executor = ActionExecutor::new(catalog.clone(), submitter);

        let first = executor
            .execute(&item, &RecoveryDecision::DeclareLost, now())
            .await
            .unwrap();
        let second = executor
            .execute(&item, &RecoveryDecision::DeclareLost, now())
            .await
            .unwrap();
        assert_eq!(
            first,
            ActionOutcome::Lost {
                newly_declared: true
            }
        );
        assert_eq!(
            second,
            ActionOutcome::Lost {
                newly_declared: false
            }
        );
        assert_eq!(catalog.replica_state(&item.key), Some(ReplicaState::Lost));
    }

    #[tokio::test]
    async fn defer_changes_nothing() {
        let catalog = Arc::new(MemoryCatalog::new());
        let submitter = Arc::new(RecordingSubmitter::new());
        let item = seeded_item(&catalog);
        let executor = ActionExecutor::new(catalog.clone(), submitter.clone());

        let outcome = executor
            .execute(&item, &RecoveryDecision::Defer, now())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Deferred);
        assert_eq!(catalog.replica_state(&item.key), Some(ReplicaState::Bad));
        assert!(submitter.submitted().is_empty());
    }
}
