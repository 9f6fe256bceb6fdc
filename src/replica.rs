// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica store: the queryable projection kept in sync with the source.
//!
//! # Version Guard
//!
//! Each object has one replica row holding the state applied last. An
//! incoming upsert is compared with the stored row on
//! `(object_version, change_number)`:
//!
//! ```text
//! incoming >  stored  → Applied    (row rewritten)
//! incoming == stored  → Unchanged  (duplicate delivery, no write)
//! incoming <  stored  → Stale      (out-of-order redelivery, ignored)
//! ```
//!
//! An absent version ranks as 0. A delete removes the row only when the
//! row's change number is not newer than the delete's, so a late DELETE
//! cannot erase a re-created object.
//!
//! Writes are applied in groups, one transaction per group.

use crate::error::Result;
use crate::scope::{ExpandLimits, ReconciliationScope, ReplicaSide, ScopeMember};
use crate::sqlite::{execute_with_retry, open_pool, recoverable};
use crate::BoxFuture;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::cmp::Ordering;
use tracing::info;

/// The applied state of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaRecord {
    pub object_type: String,
    pub object_id: String,
    pub object_version: Option<i64>,
    pub etag: String,
    pub parent_id: Option<String>,
    pub is_container: bool,
    /// Change number of the record that produced this state.
    pub change_number: i64,
    pub payload: serde_json::Value,
}

impl ReplicaRecord {
    fn rank(&self) -> (i64, i64) {
        (self.object_version.unwrap_or(0), self.change_number)
    }
}

/// One mutation inside a transactional group.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaWrite {
    Upsert(ReplicaRecord),
    /// Remove the whole object if its row is not newer than `change_number`.
    Delete {
        object_type: String,
        object_id: String,
        change_number: i64,
    },
}

/// Result of one [`ReplicaWrite`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    Unchanged,
    Stale,
    Deleted,
    /// Delete for an object the replica never held.
    Absent,
}

/// Decide what an upsert does given the stored `(version, change_number)`.
pub fn upsert_outcome(stored: Option<(Option<i64>, i64)>, incoming: &ReplicaRecord) -> WriteOutcome {
    let Some((version, change_number)) = stored else {
        return WriteOutcome::Applied;
    };
    match incoming.rank().cmp(&(version.unwrap_or(0), change_number)) {
        Ordering::Greater => WriteOutcome::Applied,
        Ordering::Equal => WriteOutcome::Unchanged,
        Ordering::Less => WriteOutcome::Stale,
    }
}

/// Decide what a delete does given the stored change number.
pub fn delete_outcome(stored_change_number: Option<i64>, change_number: i64) -> WriteOutcome {
    match stored_change_number {
        None => WriteOutcome::Absent,
        Some(stored) if stored <= change_number => WriteOutcome::Deleted,
        Some(_) => WriteOutcome::Stale,
    }
}

/// Replica operations. Only the replication manager writes through this.
pub trait ReplicaStore: Send + Sync + 'static {
    /// Apply `writes` in one transaction, returning one outcome per write.
    fn apply<'a>(&'a self, writes: &'a [ReplicaWrite]) -> BoxFuture<'a, Vec<WriteOutcome>>;

    fn get<'a>(&'a self, object_type: &'a str, object_id: &'a str)
        -> BoxFuture<'a, Option<ReplicaRecord>>;

    /// Remove every trace of an object regardless of version.
    fn delete<'a>(&'a self, object_type: &'a str, object_id: &'a str) -> BoxFuture<'a, bool>;

    /// Direct children of a container as held by the replica.
    fn list_children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>>;

    /// Guarded single-record upsert.
    fn upsert(&self, record: ReplicaRecord) -> BoxFuture<'_, WriteOutcome> {
        Box::pin(async move {
            let writes = [ReplicaWrite::Upsert(record)];
            let outcomes = self.apply(&writes).await?;
            Ok(outcomes.first().copied().unwrap_or(WriteOutcome::Unchanged))
        })
    }

    /// Ids of every object below `container_id`, recursively.
    fn container_members<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            let scope =
                ReconciliationScope::expand(&ReplicaSide(self), container_id, ExpandLimits::default())
                    .await?;
            Ok(scope.member_ids())
        })
    }
}

/// SQLite-backed replica store.
pub struct SqliteReplicaStore {
    pool: SqlitePool,
}

impl SqliteReplicaStore {
    pub async fn new(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path, "Initializing replica store");
        let pool = open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replica (
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                object_version INTEGER,
                etag TEXT NOT NULL,
                parent_id TEXT,
                is_container INTEGER NOT NULL DEFAULT 0,
                change_number INTEGER NOT NULL,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (object_type, object_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS replica_parent ON replica (parent_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(":memory:", false).await
    }

    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM replica")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply_in_tx(&self, writes: &[ReplicaWrite]) -> std::result::Result<Vec<WriteOutcome>, sqlx::Error> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(writes.len());

        for write in writes {
            let outcome = match write {
                ReplicaWrite::Upsert(record) => {
                    let stored: Option<(Option<i64>, i64)> = sqlx::query_as(
                        "SELECT object_version, change_number FROM replica
                         WHERE object_type = ? AND object_id = ?",
                    )
                    .bind(&record.object_type)
                    .bind(&record.object_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                    let outcome = upsert_outcome(stored, record);
                    if outcome == WriteOutcome::Applied {
                        sqlx::query(
                            "INSERT INTO replica (object_type, object_id, object_version, etag, parent_id,
                                                  is_container, change_number, payload, updated_at)
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                             ON CONFLICT (object_type, object_id) DO UPDATE SET
                                object_version = excluded.object_version,
                                etag = excluded.etag,
                                parent_id = excluded.parent_id,
                                is_container = excluded.is_container,
                                change_number = excluded.change_number,
                                payload = excluded.payload,
                                updated_at = excluded.updated_at",
                        )
                        .bind(&record.object_type)
                        .bind(&record.object_id)
                        .bind(record.object_version)
                        .bind(&record.etag)
                        .bind(&record.parent_id)
                        .bind(record.is_container)
                        .bind(record.change_number)
                        .bind(record.payload.to_string())
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    }
                    outcome
                }
                ReplicaWrite::Delete {
                    object_type,
                    object_id,
                    change_number,
                } => {
                    let stored: Option<(i64,)> = sqlx::query_as(
                        "SELECT change_number FROM replica WHERE object_type = ? AND object_id = ?",
                    )
                    .bind(object_type)
                    .bind(object_id)
                    .fetch_optional(&mut *tx)
                    .await?;

                    let outcome = delete_outcome(stored.map(|(n,)| n), *change_number);
                    if outcome == WriteOutcome::Deleted {
                        sqlx::query("DELETE FROM replica WHERE object_type = ? AND object_id = ?")
                            .bind(object_type)
                            .bind(object_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    outcome
                }
            };
            outcomes.push(outcome);
        }

        tx.commit().await?;
        Ok(outcomes)
    }
}

fn row_to_replica(row: &sqlx::sqlite::SqliteRow) -> Result<ReplicaRecord> {
    let payload: String = row.try_get("payload")?;
    Ok(ReplicaRecord {
        object_type: row.try_get("object_type")?,
        object_id: row.try_get("object_id")?,
        object_version: row.try_get("object_version")?,
        etag: row.try_get("etag")?,
        parent_id: row.try_get("parent_id")?,
        is_container: row.try_get("is_container")?,
        change_number: row.try_get("change_number")?,
        payload: serde_json::from_str(&payload)?,
    })
}

impl ReplicaStore for SqliteReplicaStore {
    fn apply<'a>(&'a self, writes: &'a [ReplicaWrite]) -> BoxFuture<'a, Vec<WriteOutcome>> {
        Box::pin(async move {
            if writes.is_empty() {
                return Ok(Vec::new());
            }
            execute_with_retry("replica_apply", move || self.apply_in_tx(writes))
                .await
                .map_err(|e| recoverable("replica_apply", e))
        })
    }

    fn get<'a>(&'a self, object_type: &'a str, object_id: &'a str)
        -> BoxFuture<'a, Option<ReplicaRecord>>
    {
        Box::pin(async move {
            let row = sqlx::query("SELECT * FROM replica WHERE object_type = ? AND object_id = ?")
                .bind(object_type)
                .bind(object_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| recoverable("replica_get", e))?;
            row.as_ref().map(row_to_replica).transpose()
        })
    }

    fn delete<'a>(&'a self, object_type: &'a str, object_id: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let result = execute_with_retry("replica_delete", move || {
                sqlx::query("DELETE FROM replica WHERE object_type = ? AND object_id = ?")
                    .bind(object_type)
                    .bind(object_id)
                    .execute(&self.pool)
            })
            .await
            .map_err(|e| recoverable("replica_delete", e))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn list_children<'a>(&'a self, container_id: &'a str) -> BoxFuture<'a, Vec<ScopeMember>> {
        Box::pin(async move {
            let rows: Vec<(String, String, String, bool)> = sqlx::query_as(
                "SELECT object_type, object_id, etag, is_container FROM replica
                 WHERE parent_id = ? ORDER BY object_id",
            )
            .bind(container_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| recoverable("replica_list_children", e))?;

            Ok(rows
                .into_iter()
                .map(|(object_type, object_id, etag, is_container)| ScopeMember {
                    object_type,
                    object_id,
                    etag,
                    is_container,
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, version: Option<i64>, change_number: i64) -> ReplicaRecord {
        ReplicaRecord {
            object_type: "entity".into(),
            object_id: id.into(),
            object_version: version,
            etag: format!("{id}-{change_number}"),
            parent_id: Some("root".into()),
            is_container: false,
            change_number,
            payload: json!({ "name": id, "v": version }),
        }
    }

    #[test]
    fn test_upsert_outcome_ordering() {
        let incoming = record("a", Some(5), 10);
        assert_eq!(upsert_outcome(None, &incoming), WriteOutcome::Applied);
        assert_eq!(upsert_outcome(Some((Some(7), 8)), &incoming), WriteOutcome::Stale);
        assert_eq!(upsert_outcome(Some((Some(5), 10)), &incoming), WriteOutcome::Unchanged);
        assert_eq!(upsert_outcome(Some((Some(5), 9)), &incoming), WriteOutcome::Applied);
        assert_eq!(upsert_outcome(Some((Some(4), 20)), &incoming), WriteOutcome::Applied);
    }

    #[test]
    fn test_unversioned_ranks_as_zero() {
        let incoming = record("a", None, 10);
        assert_eq!(upsert_outcome(Some((None, 9)), &incoming), WriteOutcome::Applied);
        assert_eq!(upsert_outcome(Some((Some(1), 2)), &incoming), WriteOutcome::Stale);
    }

    #[test]
    fn test_delete_outcome() {
        assert_eq!(delete_outcome(None, 5), WriteOutcome::Absent);
        assert_eq!(delete_outcome(Some(5), 5), WriteOutcome::Deleted);
        assert_eq!(delete_outcome(Some(4), 5), WriteOutcome::Deleted);
        assert_eq!(delete_outcome(Some(6), 5), WriteOutcome::Stale);
    }

    #[tokio::test]
    async fn test_upsert_and_get() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        let r = record("a", Some(1), 3);
        assert_eq!(store.upsert(r.clone()).await.unwrap(), WriteOutcome::Applied);

        let stored = store.get("entity", "a").await.unwrap().unwrap();
        assert_eq!(stored, r);
        assert!(store.get("entity", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_older_version_never_overwrites() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        store.upsert(record("a", Some(7), 20)).await.unwrap();

        let outcome = store.upsert(record("a", Some(5), 10)).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Stale);
        assert_eq!(store.get("entity", "a").await.unwrap().unwrap().object_version, Some(7));
    }

    #[tokio::test]
    async fn test_duplicate_upsert_unchanged() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        store.upsert(record("a", Some(2), 4)).await.unwrap();
        assert_eq!(
            store.upsert(record("a", Some(2), 4)).await.unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_group_apply_is_ordered() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        let writes = vec![
            ReplicaWrite::Upsert(record("a", Some(1), 1)),
            ReplicaWrite::Upsert(record("b", Some(1), 2)),
            ReplicaWrite::Delete {
                object_type: "entity".into(),
                object_id: "a".into(),
                change_number: 3,
            },
            ReplicaWrite::Delete {
                object_type: "entity".into(),
                object_id: "never".into(),
                change_number: 4,
            },
        ];
        let outcomes = store.apply(&writes).await.unwrap();
        assert_eq!(
            outcomes,
            vec![
                WriteOutcome::Applied,
                WriteOutcome::Applied,
                WriteOutcome::Deleted,
                WriteOutcome::Absent
            ]
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_late_delete_does_not_remove_recreated_object() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        store.upsert(record("a", None, 10)).await.unwrap();

        let writes = vec![ReplicaWrite::Delete {
            object_type: "entity".into(),
            object_id: "a".into(),
            change_number: 8,
        }];
        assert_eq!(store.apply(&writes).await.unwrap(), vec![WriteOutcome::Stale]);
        assert!(store.get("entity", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unguarded_delete() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        store.upsert(record("a", Some(3), 10)).await.unwrap();
        assert!(store.delete("entity", "a").await.unwrap());
        assert!(!store.delete("entity", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_container_members_recursive() {
        let store = SqliteReplicaStore::in_memory().await.unwrap();
        let mut folder = record("folder", None, 1);
        folder.is_container = true;
        let mut nested = record("nested", None, 2);
        nested.parent_id = Some("folder".into());
        store.upsert(folder).await.unwrap();
        store.upsert(nested).await.unwrap();
        store.upsert(record("leaf", None, 3)).await.unwrap();

        let mut other = record("elsewhere", None, 4);
        other.parent_id = Some("other-root".into());
        store.upsert(other).await.unwrap();

        let members = store.container_members("root").await.unwrap();
        assert_eq!(members, vec!["folder", "leaf", "nested"]);
    }

    #[tokio::test]
    async fn test_replica_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteReplicaStore::new(path, true).await.unwrap();
            store.upsert(record("a", Some(1), 1)).await.unwrap();
            store.close().await;
        }
        let store = SqliteReplicaStore::new(path, true).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
