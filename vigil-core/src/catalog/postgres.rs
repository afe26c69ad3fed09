//! Postgres-backed catalog adapter.
//!
//! Uses the runtime query API throughout; the schema is created on demand
//! with `CREATE TABLE IF NOT EXISTS` so a fresh database bootstraps itself.
//! Every write the engine depends on for idempotence is guarded in SQL:
//! state transitions check the current state, finding inserts are
//! `ON CONFLICT DO NOTHING`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::info;
use uuid::Uuid;

use crate::catalog::{EntryActivity, FindingStore, RecencyOracle, ReplicaCatalog};
use crate::config::DatabaseConfig;
use crate::error::{Result, VigilError};
use crate::rse::RseInfo;
use crate::types::{
    BadReplica, Checksum, FileKey, Finding, ReplicaKey, RseId, SiblingReplica,
};

#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    /// Wrap an existing pool after verifying the database answers.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                VigilError::Catalog(format!("catalog health check failed: {e}"))
            })?;
        info!("catalog connected to Postgres");
        Ok(Self { pool })
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.url)
            .await
            .map_err(|e| {
                VigilError::Catalog(format!("cannot connect to catalog: {e}"))
            })?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes the adapter needs.
    pub async fn initialize_schema(&self) -> Result<()> {
        info!("initializing catalog schema");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rses (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                attributes JSONB NOT NULL DEFAULT '{}'::jsonb
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| schema_err("rses", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replicas (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                rse_id UUID NOT NULL REFERENCES rses(id),
                rse TEXT NOT NULL,
                state TEXT NOT NULL,
                bytes BIGINT,
                checksum TEXT,
                reason TEXT NOT NULL DEFAULT '',
                declared_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                recovering_since TIMESTAMPTZ,
                PRIMARY KEY (scope, name, rse_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| schema_err("replicas", e))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_replicas_state ON replicas(state)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| schema_err("replicas index", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS catalog_entries (
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                deleted_at TIMESTAMPTZ,
                PRIMARY KEY (scope, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| schema_err("catalog_entries", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS findings (
                rse_id UUID NOT NULL,
                rse TEXT NOT NULL,
                path TEXT NOT NULL,
                scope TEXT,
                name TEXT,
                kind TEXT NOT NULL,
                bytes_on_storage BIGINT,
                bytes_in_catalog BIGINT,
                checksum_on_storage TEXT,
                checksum_in_catalog TEXT,
                storage_generated_at TIMESTAMPTZ NOT NULL,
                catalog_generated_at TIMESTAMPTZ NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (rse_id, path, storage_generated_at)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| schema_err("findings", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quarantined_replicas (
                rse_id UUID NOT NULL,
                path TEXT NOT NULL,
                queued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (rse_id, path)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| schema_err("quarantined_replicas", e))?;

        Ok(())
    }

    fn row_to_bad_replica(row: &PgRow) -> Result<BadReplica> {
        let state: String = row
            .try_get("state")
            .map_err(|e| row_err("state", e))?;
        Ok(BadReplica {
            key: ReplicaKey {
                file: FileKey {
                    scope: row.try_get("scope").map_err(|e| row_err("scope", e))?,
                    name: row.try_get("name").map_err(|e| row_err("name", e))?,
                },
                rse_id: RseId(
                    row.try_get::<Uuid, _>("rse_id")
                        .map_err(|e| row_err("rse_id", e))?,
                ),
            },
            rse: row.try_get("rse").map_err(|e| row_err("rse", e))?,
            state: state.parse()?,
            bytes: row
                .try_get::<Option<i64>, _>("bytes")
                .map_err(|e| row_err("bytes", e))?
                .map(|b| b as u64),
            checksum: row
                .try_get::<Option<String>, _>("checksum")
                .map_err(|e| row_err("checksum", e))?
                .map(Checksum),
            reason: row.try_get("reason").map_err(|e| row_err("reason", e))?,
            declared_at: row
                .try_get("declared_at")
                .map_err(|e| row_err("declared_at", e))?,
            recovering_since: row
                .try_get("recovering_since")
                .map_err(|e| row_err("recovering_since", e))?,
        })
    }
}

#[async_trait]
impl ReplicaCatalog for PgCatalog {
    async fn list_rses(&self) -> Result<Vec<RseInfo>> {
        let rows = sqlx::query("SELECT id, name, attributes FROM rses ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| VigilError::Catalog(format!("rse listing failed: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(RseInfo {
                    id: RseId(row.try_get::<Uuid, _>("id").map_err(|e| row_err("id", e))?),
                    name: row.try_get("name").map_err(|e| row_err("name", e))?,
                    attributes: row
                        .try_get::<serde_json::Value, _>("attributes")
                        .ok()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    async fn bad_replica_backlog(&self) -> Result<HashMap<RseId, u64>> {
        let rows: Vec<(Uuid, i64)> = sqlx::query_as(
            "SELECT rse_id, COUNT(*) FROM replicas WHERE state = 'BAD' GROUP BY rse_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Catalog(format!("backlog count failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(id, count)| (RseId(id), count.max(0) as u64))
            .collect())
    }

    async fn list_bad_replicas(
        &self,
        after: Option<&ReplicaKey>,
        limit: usize,
        rses: Option<&[RseId]>,
    ) -> Result<Vec<BadReplica>> {
        let rse_ids: Option<Vec<Uuid>> =
            rses.map(|ids| ids.iter().map(|id| id.as_uuid()).collect());

        let rows = sqlx::query(
            r#"
            SELECT scope, name, rse_id, rse, state, bytes, checksum, reason,
                   declared_at, recovering_since
            FROM replicas
            WHERE state IN ('BAD', 'RECOVERING')
              AND ($1::text IS NULL OR (scope, name, rse_id) > ($1, $2, $3::uuid))
              AND ($4::uuid[] IS NULL OR rse_id = ANY($4))
            ORDER BY scope, name, rse_id
            LIMIT $5
            "#,
        )
        .bind(after.map(|k| k.file.scope.as_str()))
        .bind(after.map(|k| k.file.name.as_str()))
        .bind(after.map(|k| k.rse_id.as_uuid()))
        .bind(rse_ids)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            VigilError::Catalog(format!("bad replica listing failed: {e}"))
        })?;

        rows.iter().map(Self::row_to_bad_replica).collect()
    }

    async fn sibling_states(&self, file: &FileKey) -> Result<Vec<SiblingReplica>> {
        let rows = sqlx::query(
            r#"
            SELECT rse_id, rse, state, recovering_since
            FROM replicas
            WHERE scope = $1 AND name = $2
            ORDER BY rse, rse_id
            "#,
        )
        .bind(&file.scope)
        .bind(&file.name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Catalog(format!("sibling lookup failed: {e}")))?;

        rows.iter()
            .map(|row| {
                let state: String =
                    row.try_get("state").map_err(|e| row_err("state", e))?;
                Ok(SiblingReplica {
                    rse_id: RseId(
                        row.try_get::<Uuid, _>("rse_id")
                            .map_err(|e| row_err("rse_id", e))?,
                    ),
                    rse: row.try_get("rse").map_err(|e| row_err("rse", e))?,
                    state: state.parse()?,
                    recovering_since: row
                        .try_get("recovering_since")
                        .map_err(|e| row_err("recovering_since", e))?,
                })
            })
            .collect()
    }

    async fn mark_recovering(
        &self,
        key: &ReplicaKey,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE replicas
            SET state = 'RECOVERING', recovering_since = $4
            WHERE scope = $1 AND name = $2 AND rse_id = $3
              AND state IN ('BAD', 'RECOVERING')
            "#,
        )
        .bind(&key.file.scope)
        .bind(&key.file.name)
        .bind(key.rse_id.as_uuid())
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            VigilError::Catalog(format!("recovering transition failed: {e}"))
        })?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_lost(&self, key: &ReplicaKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE replicas
            SET state = 'LOST', recovering_since = NULL
            WHERE scope = $1 AND name = $2 AND rse_id = $3
              AND state IN ('BAD', 'RECOVERING')
            "#,
        )
        .bind(&key.file.scope)
        .bind(&key.file.name)
        .bind(key.rse_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Catalog(format!("lost transition failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn quarantine_paths(&self, rse_id: RseId, paths: &[String]) -> Result<u64> {
        if paths.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO quarantined_replicas (rse_id, path)
            SELECT $1, UNNEST($2::text[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(rse_id.as_uuid())
        .bind(paths)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Catalog(format!("quarantine insert failed: {e}")))?;
        Ok(result.rows_affected())
    }

    async fn declare_bad(
        &self,
        rse_id: RseId,
        keys: &[FileKey],
        reason: &str,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let scopes: Vec<String> = keys.iter().map(|k| k.scope.clone()).collect();
        let names: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();

        let result = sqlx::query(
            r#"
            UPDATE replicas
            SET state = 'BAD', reason = $4, declared_at = NOW(),
                recovering_since = NULL
            WHERE rse_id = $1
              AND (scope, name) IN (
                  SELECT UNNEST($2::text[]), UNNEST($3::text[])
              )
              AND state NOT IN ('BAD', 'RECOVERING', 'LOST')
            "#,
        )
        .bind(rse_id.as_uuid())
        .bind(&scopes)
        .bind(&names)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| VigilError::Catalog(format!("bad declaration failed: {e}")))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecencyOracle for PgCatalog {
    async fn entry_activity(
        &self,
        keys: &[FileKey],
    ) -> Result<HashMap<FileKey, EntryActivity>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let scopes: Vec<String> = keys.iter().map(|k| k.scope.clone()).collect();
        let names: Vec<String> = keys.iter().map(|k| k.name.clone()).collect();

        let rows = sqlx::query(
            r#"
            SELECT scope, name, created_at, deleted_at
            FROM catalog_entries
            WHERE (scope, name) IN (
                SELECT UNNEST($1::text[]), UNNEST($2::text[])
            )
            "#,
        )
        .bind(&scopes)
        .bind(&names)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| VigilError::Catalog(format!("entry activity failed: {e}")))?;

        rows.iter()
            .map(|row| {
                let key = FileKey {
                    scope: row.try_get("scope").map_err(|e| row_err("scope", e))?,
                    name: row.try_get("name").map_err(|e| row_err("name", e))?,
                };
                let activity = EntryActivity {
                    created_at: row
                        .try_get("created_at")
                        .map_err(|e| row_err("created_at", e))?,
                    deleted_at: row
                        .try_get("deleted_at")
                        .map_err(|e| row_err("deleted_at", e))?,
                };
                Ok((key, activity))
            })
            .collect()
    }
}

#[async_trait]
impl FindingStore for PgCatalog {
    async fn record_findings(&self, findings: &[Finding]) -> Result<u64> {
        if findings.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(|e| {
            VigilError::Catalog(format!("finding transaction failed: {e}"))
        })?;

        let mut inserted = 0;
        for finding in findings {
            let result = sqlx::query(
                r#"
                INSERT INTO findings (
                    rse_id, rse, path, scope, name, kind,
                    bytes_on_storage, bytes_in_catalog,
                    checksum_on_storage, checksum_in_catalog,
                    storage_generated_at, catalog_generated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (rse_id, path, storage_generated_at) DO NOTHING
                "#,
            )
            .bind(finding.rse_id.as_uuid())
            .bind(&finding.rse)
            .bind(&finding.path)
            .bind(finding.key.as_ref().map(|k| k.scope.as_str()))
            .bind(finding.key.as_ref().map(|k| k.name.as_str()))
            .bind(finding.kind.as_str())
            .bind(finding.bytes_on_storage.map(|b| b as i64))
            .bind(finding.bytes_in_catalog.map(|b| b as i64))
            .bind(finding.checksum_on_storage.as_ref().map(|c| c.0.as_str()))
            .bind(finding.checksum_in_catalog.as_ref().map(|c| c.0.as_str()))
            .bind(finding.storage_generated_at)
            .bind(finding.catalog_generated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                VigilError::Catalog(format!("finding insert failed: {e}"))
            })?;
            inserted += result.rows_affected();
        }

        tx.commit().await.map_err(|e| {
            VigilError::Catalog(format!("finding commit failed: {e}"))
        })?;
        Ok(inserted)
    }
}

fn schema_err(table: &str, e: sqlx::Error) -> VigilError {
    VigilError::Catalog(format!("cannot create {table}: {e}"))
}

fn row_err(column: &str, e: sqlx::Error) -> VigilError {
    VigilError::Catalog(format!("malformed catalog row ({column}): {e}"))
}
