//! Per-replica recovery planning.
//!
//! The planner is a pure decision function over one bad replica and the
//! current states of its siblings. Same inputs, same decision; the executor
//! owns all side effects.

use chrono::{DateTime, Duration, Utc};

use crate::types::{BadReplica, ReplicaState, SiblingReplica};

/// What to do about one bad replica this cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Re-transfer from `source` to the damaged RSE.
    Repair { source: SiblingReplica },
    /// No copy left anywhere: declare the replica lost.
    DeclareLost,
    /// A repair is already in flight for this file; check again next cycle.
    Defer,
}

/// Source states in preference order. Within a tier the catalog's listing
/// order breaks ties, so planning is stable across runs.
const SOURCE_PREFERENCE: [ReplicaState; 3] = [
    ReplicaState::Available,
    ReplicaState::TemporarilyUnavailable,
    ReplicaState::Repaired,
];

/// Decide a recovery action for `item` given its siblings.
///
/// A recovery younger than `recovering_timeout`, on the replica itself or on
/// any sibling of the same file, defers; one older than the timeout is
/// treated as abandoned and planned from scratch.
pub fn plan(
    item: &BadReplica,
    siblings: &[SiblingReplica],
    recovering_timeout: Duration,
    now: DateTime<Utc>,
) -> RecoveryDecision {
    if item.state == ReplicaState::Recovering
        && is_fresh(item.recovering_since, recovering_timeout, now)
    {
        return RecoveryDecision::Defer;
    }
    let sibling_in_flight = siblings.iter().any(|sibling| {
        sibling.rse_id != item.key.rse_id
            && sibling.state == ReplicaState::Recovering
            && is_fresh(sibling.recovering_since, recovering_timeout, now)
    });
    if sibling_in_flight {
        return RecoveryDecision::Defer;
    }

    match select_source(item, siblings) {
        Some(source) => RecoveryDecision::Repair {
            source: source.clone(),
        },
        None => RecoveryDecision::DeclareLost,
    }
}

fn is_fresh(since: Option<DateTime<Utc>>, timeout: Duration, now: DateTime<Utc>) -> bool {
    since.is_some_and(|at| now - at < timeout)
}

fn select_source<'a>(
    item: &BadReplica,
    siblings: &'a [SiblingReplica],
) -> Option<&'a SiblingReplica> {
    SOURCE_PREFERENCE.iter().find_map(|wanted| {
        siblings
            .iter()
            .find(|sibling| sibling.rse_id != item.key.rse_id && sibling.state == *wanted)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    use crate::types::{FileKey, ReplicaKey, RseId};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap()
    }

    fn bad_replica(rse_id: RseId) -> BadReplica {
        BadReplica {
            key: ReplicaKey::new(FileKey::new("data", "f1.root"), rse_id),
            rse: "SITE_BAD".to_string(),
            state: ReplicaState::Bad,
            bytes: Some(1024),
            checksum: None,
            reason: "checksum mismatch".to_string(),
            declared_at: now() - Duration::hours(1),
            recovering_since: None,
        }
    }

    fn sibling(n: u128, state: ReplicaState) -> SiblingReplica {
        SiblingReplica {
            rse_id: RseId(Uuid::from_u128(n)),
            rse: format!("SITE_{n}"),
            state,
            recovering_since: None,
        }
    }

    fn timeout() -> Duration {
        Duration::hours(24)
    }

    #[test]
    fn no_usable_sibling_means_lost() {
        let item = bad_replica(RseId(Uuid::from_u128(99)));
        assert_eq!(
            plan(&item, &[], timeout(), now()),
            RecoveryDecision::DeclareLost
        );

        let siblings = vec![
            sibling(1, ReplicaState::Bad),
            sibling(2, ReplicaState::Lost),
        ];
        assert_eq!(
            plan(&item, &siblings, timeout(), now()),
            RecoveryDecision::DeclareLost
        );
    }

    #[test]
    fn available_beats_earlier_listed_lower_tiers() {
        let item = bad_replica(RseId(Uuid::from_u128(99)));
        let siblings = vec![
            sibling(1, ReplicaState::Repaired),
            sibling(2, ReplicaState::TemporarilyUnavailable),
            sibling(3, ReplicaState::Available),
        ];
        let decision = plan(&item, &siblings, timeout(), now());
        assert_eq!(
            decision,
            RecoveryDecision::Repair {
                source: siblings[2].clone()
            }
        );
    }

    #[test]
    fn listing_order_breaks_ties_within_a_tier() {
        let item = bad_replica(RseId(Uuid::from_u128(99)));
        let siblings = vec![
            sibling(7, ReplicaState::Available),
            sibling(2, ReplicaState::Available),
        ];
        let decision = plan(&item, &siblings, timeout(), now());
        assert_eq!(
            decision,
            RecoveryDecision::Repair {
                source: siblings[0].clone()
            }
        );
    }

    #[test]
    fn degraded_tiers_are_still_sources() {
        let item = bad_replica(RseId(Uuid::from_u128(99)));
        let siblings = vec![sibling(1, ReplicaState::Repaired)];
        assert_eq!(
            plan(&item, &siblings, timeout(), now()),
            RecoveryDecision::Repair {
                source: siblings[0].clone()
            }
        );
    }

    #[test]
    fn own_row_in_the_sibling_listing_is_not_a_source() {
        let self_id = RseId(Uuid::from_u128(99));
        let item = bad_replica(self_id);
        // Catalog listings include the damaged replica itself.
        let siblings = vec![SiblingReplica {
            rse_id: self_id,
            rse: "SITE_BAD".to_string(),
            state: ReplicaState::Available,
            recovering_since: None,
        }];
        assert_eq!(
            plan(&item, &siblings, timeout(), now()),
            RecoveryDecision::DeclareLost
        );
    }

    #[test]
    fn fresh_own_recovery_defers_and_stale_replans() {
        let mut item = bad_replica(RseId(Uuid::from_u128(99)));
        item.state = ReplicaState::Recovering;
        let siblings = vec![sibling(1, ReplicaState::Available)];

        item.recovering_since = Some(now() - Duration::hours(2));
        assert_eq!(
            plan(&item, &siblings, timeout(), now()),
            RecoveryDecision::Defer
        );

        item.recovering_since = Some(now() - Duration::hours(25));
        assert_eq!(
            plan(&item, &siblings, timeout(), now()),
            RecoveryDecision::Repair {
                source: siblings[0].clone()
            }
        );
    }

    #[test]
    fn fresh_sibling_recovery_defers_stale_one_is_ignored() {
        let item = bad_replica(RseId(Uuid::from_u128(99)));
        let mut recovering = sibling(1, ReplicaState::Recovering);
        let available = sibling(2, ReplicaState::Available);

        recovering.recovering_since = Some(now() - Duration::hours(1));
        assert_eq!(
            plan(
                &item,
                &[recovering.clone(), available.clone()],
                timeout(),
                now()
            ),
            RecoveryDecision::Defer
        );

        recovering.recovering_since = Some(now() - Duration::days(2));
        assert_eq!(
            plan(&item, &[recovering, available.clone()], timeout(), now()),
            RecoveryDecision::Repair { source: available }
        );
    }

    #[test]
    fn recovering_without_timestamp_is_treated_as_abandoned() {
        let mut item = bad_replica(RseId(Uuid::from_u128(99)));
        item.state = ReplicaState::Recovering;
        item.recovering_since = None;
        let siblings = vec![sibling(1, ReplicaState::Available)];
        assert_eq!(
            plan(&item, &siblings, timeout(), now()),
            RecoveryDecision::Repair {
                source: siblings[0].clone()
            }
        );
    }
}
