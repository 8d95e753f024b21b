//! libSQL storage layer (local, offline).
//!
//! The [`Storage`] struct wraps a libSQL database holding estimator timing
//! history and a cache of finished task results.
//!
//! **Access rules:**
//! - CLI commands that run tasks: read-write via [`Storage::open`]
//! - Inspection commands (`estimate`): read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use studydeck_shared::{OperationType, Result, StudyDeckError, TaskResult, TimingRecord};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn db_err(e: libsql::Error) -> StudyDeckError {
    StudyDeckError::Storage(e.to_string())
}

/// Timestamps are stored as fixed-width UTC strings so text order is time order.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StudyDeckError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        StudyDeckError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(StudyDeckError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timing history
    // -----------------------------------------------------------------------

    /// Append one observed task duration.
    pub async fn append_timing(&self, record: &TimingRecord) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO timing_records (operation, unit_count, actual_seconds, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.operation.as_str(),
                    i64::from(record.unit_count),
                    record.actual_seconds,
                    timestamp(record.recorded_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// All timing records, oldest first.
    pub async fn load_timings(&self) -> Result<Vec<TimingRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT operation, unit_count, actual_seconds, recorded_at
                 FROM timing_records ORDER BY recorded_at, id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_timing(&row)?);
        }
        Ok(results)
    }

    /// Drop records older than `max_age_days`, then keep only the newest
    /// `per_type_cap` records of each operation. Returns rows deleted.
    pub async fn prune_timings(&self, max_age_days: i64, per_type_cap: usize) -> Result<u64> {
        self.check_writable()?;
        let cutoff = timestamp(Utc::now() - Duration::days(max_age_days));

        let mut deleted = self
            .conn
            .execute(
                "DELETE FROM timing_records WHERE recorded_at < ?1",
                params![cutoff],
            )
            .await
            .map_err(db_err)?;

        let cap = i64::try_from(per_type_cap).unwrap_or(i64::MAX);
        for op in OperationType::ALL {
            deleted += self
                .conn
                .execute(
                    "DELETE FROM timing_records WHERE id IN (
                         SELECT id FROM timing_records WHERE operation = ?1
                         ORDER BY recorded_at DESC, id DESC
                         LIMIT -1 OFFSET ?2
                     )",
                    params![op.as_str(), cap],
                )
                .await
                .map_err(db_err)?;
        }

        if deleted > 0 {
            tracing::debug!(deleted, max_age_days, per_type_cap, "pruned timing history");
        }
        Ok(deleted)
    }

    // -----------------------------------------------------------------------
    // Result cache
    // -----------------------------------------------------------------------

    /// Look up a finished result for `op_key` over content `fingerprint`.
    pub async fn get_cached_result(
        &self,
        op_key: &str,
        fingerprint: &str,
    ) -> Result<Option<TaskResult>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM result_cache WHERE op_key = ?1 AND fingerprint = ?2",
                params![op_key, fingerprint],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(db_err)?;
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    /// Store a finished result (upserts).
    pub async fn put_cached_result(
        &self,
        op_key: &str,
        fingerprint: &str,
        result: &TaskResult,
    ) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(result)?;
        self.conn
            .execute(
                "INSERT INTO result_cache (op_key, fingerprint, operation, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(op_key, fingerprint) DO UPDATE SET
                   result_json = excluded.result_json,
                   created_at = excluded.created_at",
                params![
                    op_key,
                    fingerprint,
                    result.operation().as_str(),
                    json,
                    timestamp(Utc::now()),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Remove every cached result. Returns rows deleted.
    pub async fn clear_result_cache(&self) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM result_cache", params![])
            .await
            .map_err(db_err)
    }
}

/// Convert a database row to a [`TimingRecord`].
fn row_to_timing(row: &libsql::Row) -> Result<TimingRecord> {
    let operation: String = row.get(0).map_err(db_err)?;
    let unit_count: i64 = row.get(1).map_err(db_err)?;
    let recorded_at: String = row.get(3).map_err(db_err)?;

    Ok(TimingRecord {
        operation: operation.parse().map_err(StudyDeckError::Storage)?,
        unit_count: u32::try_from(unit_count)
            .map_err(|e| StudyDeckError::Storage(format!("invalid unit count: {e}")))?,
        actual_seconds: row.get::<f64>(2).map_err(db_err)?,
        recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StudyDeckError::Storage(format!("invalid date: {e}")))?,
    })
}
