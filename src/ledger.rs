// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change ledger access.
//!
//! The ledger holds the latest change record for every object plus a
//! sent mark per object recording which change number was last handed to
//! the queue. A change replaces the object's previous record and clears
//! its sent mark, so "unsent" is simply a change row with no matching mark.
//!
//! ```text
//! changes                         sent_messages
//! ┌────┬──────────┬──────┐        ┌──────────┬──────┐
//! │ cn │ object   │ type │        │ object   │ cn   │
//! ├────┼──────────┼──────┤        ├──────────┼──────┤
//! │ 41 │ entity/a │ UPD  │ ◄────► │ entity/a │ 41   │  sent
//! │ 42 │ entity/b │ CRE  │        │ entity/b │ NULL │  unsent
//! └────┴──────────┴──────┘        └──────────┴──────┘
//! ```

use crate::change::{ChangeRecord, ChangeType, Checksum, RangeChecksum};
use crate::error::Result;
use crate::sqlite::{execute_with_retry, open_pool, recoverable};
use crate::BoxFuture;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, info};

/// Ledger operations consumed by the publish path and the reconcilers.
pub trait ChangeLedger: Send + Sync + 'static {
    /// Highest change number in the ledger, `None` when empty.
    fn current_change_number(&self) -> BoxFuture<'_, Option<i64>>;

    /// Lowest change number in the ledger, `None` when empty.
    fn minimum_change_number(&self) -> BoxFuture<'_, Option<i64>>;

    /// Digests of the ledger's and the sent marks' change numbers in `[lo, hi]`.
    fn checksum_for_range(&self, lo: i64, hi: i64) -> BoxFuture<'_, RangeChecksum>;

    /// Records in `[lo, hi]` without a sent mark whose timestamp is at or
    /// before `older_than` (epoch millis), ordered by change number.
    fn list_unsent(&self, lo: i64, hi: i64, older_than: i64) -> BoxFuture<'_, Vec<ChangeRecord>>;

    /// Mark `record` as handed to the queue.
    fn register_sent<'a>(&'a self, record: &'a ChangeRecord) -> BoxFuture<'a, ()>;
}

/// SQLite-backed change ledger.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (and create if needed) a ledger at `path`.
    pub async fn new(path: &str, wal_mode: bool) -> Result<Self> {
        info!(path, "Initializing change ledger");
        let pool = open_pool(path, wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS changes (
                change_number INTEGER PRIMARY KEY AUTOINCREMENT,
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                object_version INTEGER,
                change_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                UNIQUE (object_type, object_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sent_messages (
                object_type TEXT NOT NULL,
                object_id TEXT NOT NULL,
                change_number INTEGER,
                timestamp INTEGER NOT NULL,
                PRIMARY KEY (object_type, object_id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS sent_messages_cn ON sent_messages (change_number)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new(":memory:", false).await
    }

    /// Record a mutation of an object, replacing its previous change.
    ///
    /// Assigns the next change number and clears the object's sent mark.
    pub async fn replace_change(
        &self,
        object_type: &str,
        object_id: &str,
        object_version: Option<i64>,
        change_type: ChangeType,
    ) -> Result<ChangeRecord> {
        let now = chrono::Utc::now().timestamp_millis();
        self.replace_change_at(object_type, object_id, object_version, change_type, now)
            .await
    }

    /// [`replace_change`](Self::replace_change) with an explicit timestamp.
    pub async fn replace_change_at(
        &self,
        object_type: &str,
        object_id: &str,
        object_version: Option<i64>,
        change_type: ChangeType,
        timestamp: i64,
    ) -> Result<ChangeRecord> {
        let change_number = execute_with_retry("ledger_replace_change", || async move {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM changes WHERE object_type = ? AND object_id = ?")
                .bind(object_type)
                .bind(object_id)
                .execute(&mut *tx)
                .await?;
            let inserted = sqlx::query(
                "INSERT INTO changes (object_type, object_id, object_version, change_type, timestamp)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(object_type)
            .bind(object_id)
            .bind(object_version)
            .bind(change_type.as_str())
            .bind(timestamp)
            .execute(&mut *tx)
            .await?;
            sqlx::query(
                "INSERT INTO sent_messages (object_type, object_id, change_number, timestamp)
                 VALUES (?, ?, NULL, ?)
                 ON CONFLICT (object_type, object_id)
                 DO UPDATE SET change_number = NULL, timestamp = excluded.timestamp",
            )
            .bind(object_type)
            .bind(object_id)
            .bind(timestamp)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(inserted.last_insert_rowid())
        })
        .await?;

        Ok(ChangeRecord {
            change_number,
            object_id: object_id.to_string(),
            object_type: object_type.to_string(),
            object_version,
            change_type,
            timestamp,
            synthetic: false,
        })
    }

    /// Remove an object's change and sent mark entirely.
    pub async fn delete_change(&self, object_type: &str, object_id: &str) -> Result<()> {
        execute_with_retry("ledger_delete_change", || async move {
            let mut tx = self.pool.begin().await?;
            for table in ["changes", "sent_messages"] {
                sqlx::query(&format!(
                    "DELETE FROM {table} WHERE object_type = ? AND object_id = ?"
                ))
                .bind(object_type)
                .bind(object_id)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Whether `change_number` currently carries a sent mark.
    pub async fn is_sent(&self, change_number: i64) -> Result<bool> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM sent_messages WHERE change_number = ?")
                .bind(change_number)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0 > 0)
    }

    /// Drop the sent mark for a change, as a crash between publish and
    /// mark would leave it.
    pub async fn clear_sent(&self, change_number: i64) -> Result<()> {
        sqlx::query("UPDATE sent_messages SET change_number = NULL WHERE change_number = ?")
            .bind(change_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Number of changes still lacking a sent mark.
    pub async fn count_unsent(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM changes c
             LEFT JOIN sent_messages s ON c.change_number = s.change_number
             WHERE s.change_number IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.max(0) as u64)
    }

    async fn change_numbers_in(&self, table: &str, lo: i64, hi: i64) -> Result<Vec<i64>> {
        let sql = format!(
            "SELECT change_number FROM {table} WHERE change_number >= ? AND change_number <= ?"
        );
        let rows: Vec<(i64,)> = sqlx::query_as(&sql)
            .bind(lo)
            .bind(hi)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(n,)| n).collect())
    }

    /// Close the pool (includes WAL checkpoint).
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ChangeRecord> {
    let change_type: String = row.try_get("change_type")?;
    Ok(ChangeRecord {
        change_number: row.try_get("change_number")?,
        object_id: row.try_get("object_id")?,
        object_type: row.try_get("object_type")?,
        object_version: row.try_get("object_version")?,
        change_type: change_type.parse()?,
        timestamp: row.try_get("timestamp")?,
        synthetic: false,
    })
}

impl ChangeLedger for SqliteLedger {
    fn current_change_number(&self) -> BoxFuture<'_, Option<i64>> {
        Box::pin(async move {
            let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(change_number) FROM changes")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| recoverable("ledger_max_change_number", e))?;
            Ok(row.0)
        })
    }

    fn minimum_change_number(&self) -> BoxFuture<'_, Option<i64>> {
        Box::pin(async move {
            let row: (Option<i64>,) = sqlx::query_as("SELECT MIN(change_number) FROM changes")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| recoverable("ledger_min_change_number", e))?;
            Ok(row.0)
        })
    }

    fn checksum_for_range(&self, lo: i64, hi: i64) -> BoxFuture<'_, RangeChecksum> {
        Box::pin(async move {
            let ledger = self.change_numbers_in("changes", lo, hi).await?;
            let sent = self.change_numbers_in("sent_messages", lo, hi).await?;
            Ok(RangeChecksum {
                ledger: Checksum::of(ledger),
                sent: Checksum::of(sent),
            })
        })
    }

    fn list_unsent(&self, lo: i64, hi: i64, older_than: i64) -> BoxFuture<'_, Vec<ChangeRecord>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT c.* FROM changes c
                 LEFT JOIN sent_messages s ON c.change_number = s.change_number
                 WHERE s.change_number IS NULL
                   AND c.change_number >= ? AND c.change_number <= ?
                   AND c.timestamp <= ?
                 ORDER BY c.change_number",
            )
            .bind(lo)
            .bind(hi)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;

            rows.iter().map(row_to_record).collect()
        })
    }

    fn register_sent<'a>(&'a self, record: &'a ChangeRecord) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let now = chrono::Utc::now().timestamp_millis();
            // Only mark the change the object currently holds; a stale
            // publish must not shadow a newer unsent change.
            let pool = &self.pool;
            let object_type = record.object_type.as_str();
            let object_id = record.object_id.as_str();
            let change_number = record.change_number;
            let result = execute_with_retry("ledger_register_sent", move || {
                sqlx::query(
                    "INSERT INTO sent_messages (object_type, object_id, change_number, timestamp)
                     SELECT ?, ?, ?, ?
                     WHERE EXISTS (
                        SELECT 1 FROM changes
                        WHERE change_number = ? AND object_type = ? AND object_id = ?
                     )
                     ON CONFLICT (object_type, object_id)
                     DO UPDATE SET change_number = excluded.change_number, timestamp = excluded.timestamp",
                )
                .bind(object_type)
                .bind(object_id)
                .bind(change_number)
                .bind(now)
                .bind(change_number)
                .bind(object_type)
                .bind(object_id)
                .execute(pool)
            })
            .await
            .map_err(|e| recoverable("ledger_register_sent", e))?;

            if result.rows_affected() == 0 {
                debug!(
                    change_number = record.change_number,
                    object_id = %record.object_id,
                    "Change superseded before sent mark was written"
                );
            }
            Ok(())
        })
    }
}
