//! PostgreSQL implementation of [`SyncStore`]

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::models::*;
use super::SyncStore;
use crate::db::{DbError, DbResult};

const RUN_COLUMNS: &str = "id, started_at, finished_at, status, is_manual, stop_requested, \
                           files_processed, records_loaded, error_message";
const ARCHIVE_COLUMNS: &str = "id, url, file_path, file_size, sha256_hash, status, error_message, \
                               sync_run_id, created_at, downloaded_at, processed_at";
const FRAGMENT_COLUMNS: &str = "id, zip_archive_id, file_name, data_type, status, records_count, \
                                error_message, created_at, processed_at";

const RECONCILED_STOPPING: &str = "Run hung while stopping (reconciled)";
const RECONCILED_ABORTED: &str = "Run hung and was aborted (reconciled)";

fn decode_err(err: UnknownVariant) -> DbError {
    DbError::Sqlx(sqlx::Error::Decode(Box::new(err)))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Store backed by a shared connection pool
#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Multi-row insert of a whole batch; fails as a unit.
    async fn insert_batch_fast(
        tx: &mut Transaction<'_, Postgres>,
        records: &[NewRecord],
    ) -> Result<u64, sqlx::Error> {
        let mut query_builder = QueryBuilder::new(
            r#"
            INSERT INTO parsed_records (
                zip_archive_id, xml_fragment_id, record_type,
                record_key, record_date, payload, raw_xml
            )
            "#,
        );

        query_builder.push_values(records.iter(), |mut b, record| {
            b.push_bind(record.archive_id)
                .push_bind(record.fragment_id)
                .push_bind(record.kind.as_str())
                .push_bind(record.key.as_deref())
                .push_bind(record.date)
                .push_bind(serde_json::Value::Object(record.payload.clone()))
                .push_bind(record.raw_xml.as_str());
        });

        let result = query_builder.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn insert_one(
        conn: &mut sqlx::PgConnection,
        record: &NewRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO parsed_records (
                zip_archive_id, xml_fragment_id, record_type,
                record_key, record_date, payload, raw_xml
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.archive_id)
        .bind(record.fragment_id)
        .bind(record.kind.as_str())
        .bind(record.key.as_deref())
        .bind(record.date)
        .bind(serde_json::Value::Object(record.payload.clone()))
        .bind(record.raw_xml.as_str())
        .execute(conn)
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn create_run(&self, manual: bool) -> DbResult<SyncRun> {
        let sql = format!(
            "INSERT INTO sync_runs (status, is_manual) VALUES ('running', $1) RETURNING {}",
            RUN_COLUMNS
        );
        let run = sqlx::query_as::<_, SyncRun>(&sql)
            .bind(manual)
            .fetch_one(&self.pool)
            .await?;
        debug!(run_id = %run.id, manual, "Created sync run");
        Ok(run)
    }

    async fn get_run(&self, id: RunId) -> DbResult<Option<SyncRun>> {
        let sql = format!("SELECT {} FROM sync_runs WHERE id = $1", RUN_COLUMNS);
        Ok(sqlx::query_as::<_, SyncRun>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn active_run(&self) -> DbResult<Option<SyncRun>> {
        let sql = format!(
            "SELECT {} FROM sync_runs WHERE status IN ('running', 'stopping') \
             ORDER BY started_at DESC LIMIT 1",
            RUN_COLUMNS
        );
        Ok(sqlx::query_as::<_, SyncRun>(&sql)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn latest_paused_run(&self) -> DbResult<Option<SyncRun>> {
        let sql = format!(
            "SELECT {} FROM sync_runs WHERE status = 'paused' ORDER BY started_at DESC LIMIT 1",
            RUN_COLUMNS
        );
        Ok(sqlx::query_as::<_, SyncRun>(&sql)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn is_stop_requested(&self, id: RunId) -> DbResult<bool> {
        let flag = sqlx::query_scalar::<_, bool>("SELECT stop_requested FROM sync_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(flag.unwrap_or(false))
    }

    async fn request_stop(&self, id: RunId) -> DbResult<bool> {
        sqlx::query(
            r#"
            UPDATE sync_runs
            SET stop_requested = TRUE,
                status = 'stopping'
            WHERE id = $1 AND status IN ('running', 'stopping')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM sync_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Ok(exists)
    }

    async fn finish_run(
        &self,
        id: RunId,
        status: RunStatus,
        message: Option<&str>,
        counters: RunCounters,
    ) -> DbResult<RunStatus> {
        // SET expressions read the pre-update row, so the stop checks see the old state
        let written = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE sync_runs
            SET status = CASE
                    WHEN status = 'stopping' OR stop_requested THEN 'stopped'
                    ELSE $2
                END,
                error_message = CASE
                    WHEN status = 'stopping' OR stop_requested THEN COALESCE($3, $6)
                    ELSE $3
                END,
                finished_at = NOW(),
                files_processed = $4,
                records_loaded = $5,
                stop_requested = FALSE
            WHERE id = $1 AND status NOT IN ('completed', 'error', 'stopped', 'aborted')
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .bind(to_i64(counters.files_processed))
        .bind(to_i64(counters.records_loaded))
        .bind(STOPPED_BY_OPERATOR)
        .fetch_optional(&self.pool)
        .await?;

        // Already closed by force-finish or reconciliation; leave it be
        let written = match written {
            Some(status) => status,
            None => sqlx::query_scalar::<_, String>("SELECT status FROM sync_runs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::not_found("Run", id))?,
        };

        written.parse().map_err(decode_err)
    }

    async fn force_finish(&self, id: RunId, message: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = 'stopped',
                finished_at = NOW(),
                error_message = $2,
                stop_requested = TRUE
            WHERE id = $1 AND status NOT IN ('completed', 'error', 'stopped', 'aborted')
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reconcile_stale_runs(&self, threshold: Duration) -> DbResult<Vec<ReconciledRun>> {
        let cutoff = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
            .ok_or_else(|| DbError::config("stale run threshold is out of range"))?;

        let rows = sqlx::query_as::<_, (RunId, String)>(
            r#"
            UPDATE sync_runs
            SET status = CASE WHEN status = 'stopping' THEN 'stopped' ELSE 'aborted' END,
                finished_at = COALESCE(finished_at, NOW()),
                error_message = COALESCE(
                    error_message,
                    CASE WHEN status = 'stopping' THEN $2 ELSE $3 END
                ),
                stop_requested = FALSE
            WHERE status IN ('running', 'stopping')
              AND finished_at IS NULL
              AND started_at < $1
            RETURNING id, status
            "#,
        )
        .bind(cutoff)
        .bind(RECONCILED_STOPPING)
        .bind(RECONCILED_ABORTED)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, status)| {
                Ok(ReconciledRun {
                    id,
                    status: status.parse().map_err(decode_err)?,
                })
            })
            .collect()
    }

    async fn run_stats(&self, id: RunId) -> DbResult<RunStats> {
        let stats = sqlx::query_as::<_, RunStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM zip_archives WHERE sync_run_id = $1) AS archives,
                (SELECT COUNT(*) FROM xml_fragments f
                   JOIN zip_archives a ON f.zip_archive_id = a.id
                  WHERE a.sync_run_id = $1) AS fragments,
                (SELECT COUNT(*) FROM parsed_records r
                   JOIN zip_archives a ON r.zip_archive_id = a.id
                  WHERE a.sync_run_id = $1) AS records,
                (SELECT COUNT(*) FROM operation_log WHERE sync_run_id = $1) AS log_entries
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn delete_run(&self, id: RunId) -> DbResult<DeletedRun> {
        let mut tx = self.pool.begin().await?;

        let detached = sqlx::query("UPDATE zip_archives SET sync_run_id = NULL WHERE sync_run_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let logs = sqlx::query("DELETE FROM operation_log WHERE sync_run_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let deleted = sqlx::query("DELETE FROM sync_runs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        if deleted == 0 {
            tx.rollback().await?;
            return Err(DbError::not_found("Run", id));
        }

        tx.commit().await?;
        Ok(DeletedRun {
            archives_detached: detached,
            logs_deleted: logs,
        })
    }

    async fn upsert_dataset(&self, dataset: &NewDataset) -> DbResult<Dataset> {
        let row = sqlx::query_as::<_, Dataset>(
            r#"
            INSERT INTO datasets (identifier, title, link, data_type)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (identifier) DO UPDATE
            SET title = EXCLUDED.title,
                link = EXCLUDED.link,
                data_type = COALESCE(EXCLUDED.data_type, datasets.data_type),
                updated_at = NOW()
            RETURNING id, identifier, title, link, data_type
            "#,
        )
        .bind(&dataset.identifier)
        .bind(&dataset.title)
        .bind(&dataset.link)
        .bind(dataset.kind.map(|k| k.as_str()))
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_dataset(&self, id: DatasetId) -> DbResult<Option<Dataset>> {
        Ok(sqlx::query_as::<_, Dataset>(
            "SELECT id, identifier, title, link, data_type FROM datasets WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn set_dataset_kind(&self, id: DatasetId, kind: RecordKind) -> DbResult<()> {
        let result =
            sqlx::query("UPDATE datasets SET data_type = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(kind.as_str())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Dataset", id));
        }
        Ok(())
    }

    async fn insert_version(&self, version: &NewDatasetVersion) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO dataset_versions (
                dataset_id, source_url, created_date, provenance, structure_version
            )
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dataset_id, source_url) DO NOTHING
            "#,
        )
        .bind(version.dataset_id)
        .bind(&version.source_url)
        .bind(&version.created)
        .bind(&version.provenance)
        .bind(&version.structure)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_archive_by_url(&self, url: &str) -> DbResult<Option<Archive>> {
        let sql = format!("SELECT {} FROM zip_archives WHERE url = $1", ARCHIVE_COLUMNS);
        Ok(sqlx::query_as::<_, Archive>(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_archive(&self, id: ArchiveId) -> DbResult<Option<Archive>> {
        let sql = format!("SELECT {} FROM zip_archives WHERE id = $1", ARCHIVE_COLUMNS);
        Ok(sqlx::query_as::<_, Archive>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn processed_hash_exists(
        &self,
        hash: &str,
        except: Option<ArchiveId>,
    ) -> DbResult<bool> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM zip_archives
                WHERE sha256_hash = $1
                  AND status = 'processed'
                  AND ($2::uuid IS NULL OR id <> $2)
            )
            "#,
        )
        .bind(hash)
        .bind(except)
        .fetch_one(&self.pool)
        .await?;
        Ok(found)
    }

    async fn register_archive(&self, url: &str, run_id: Option<RunId>) -> DbResult<Archive> {
        sqlx::query(
            r#"
            INSERT INTO zip_archives (url, status, sync_run_id)
            VALUES ($1, 'pending', $2)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(url)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        self.find_archive_by_url(url)
            .await?
            .ok_or_else(|| DbError::not_found("Archive", url))
    }

    async fn mark_archive_downloaded(
        &self,
        id: ArchiveId,
        file_path: &str,
        file_size: u64,
        hash: &str,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE zip_archives
            SET status = 'downloaded',
                file_path = $2,
                file_size = $3,
                sha256_hash = $4,
                error_message = NULL,
                downloaded_at = NOW()
            WHERE id = $1 AND status <> 'processed'
            "#,
        )
        .bind(id)
        .bind(file_path)
        .bind(to_i64(file_size))
        .bind(hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_archive_processed(&self, id: ArchiveId) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE zip_archives
            SET status = 'processed', error_message = NULL, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_archive_error(&self, id: ArchiveId, message: &str) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE zip_archives
            SET status = 'error', error_message = $2
            WHERE id = $1 AND status <> 'processed'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_fragment(
        &self,
        archive_id: ArchiveId,
        file_name: &str,
    ) -> DbResult<Fragment> {
        let sql = format!(
            "INSERT INTO xml_fragments (zip_archive_id, file_name, status) \
             VALUES ($1, $2, 'parsing') RETURNING {}",
            FRAGMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Fragment>(&sql)
            .bind(archive_id)
            .bind(file_name)
            .fetch_one(&self.pool)
            .await?)
    }

    async fn get_fragment(&self, id: FragmentId) -> DbResult<Option<Fragment>> {
        let sql = format!("SELECT {} FROM xml_fragments WHERE id = $1", FRAGMENT_COLUMNS);
        Ok(sqlx::query_as::<_, Fragment>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn set_fragment_kind(&self, id: FragmentId, kind: FragmentKind) -> DbResult<()> {
        sqlx::query("UPDATE xml_fragments SET data_type = $2 WHERE id = $1")
            .bind(id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_fragment(&self, id: FragmentId, outcome: &FragmentOutcome) -> DbResult<()> {
        let (status, kind, records, message) = match outcome {
            FragmentOutcome::Loaded { kind, records } => (
                FragmentStatus::Loaded,
                Some(FragmentKind::from(*kind)),
                *records,
                None,
            ),
            FragmentOutcome::Unclassified => (
                FragmentStatus::Error,
                Some(FragmentKind::Unknown),
                0,
                Some(UNCLASSIFIED_DOCUMENT.to_string()),
            ),
            FragmentOutcome::Failed { message } => {
                (FragmentStatus::Error, None, 0, Some(message.clone()))
            },
            FragmentOutcome::Cancelled { records } => (
                FragmentStatus::Error,
                None,
                *records,
                Some(CANCELLED_BY_STOP.to_string()),
            ),
        };

        sqlx::query(
            r#"
            UPDATE xml_fragments
            SET status = $2,
                data_type = COALESCE($3, data_type),
                records_count = $4,
                error_message = $5,
                processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(kind.map(|k| k.as_str()))
        .bind(to_i64(records))
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fragments_for_reclassification(
        &self,
        dataset_id: DatasetId,
        kind: RecordKind,
    ) -> DbResult<Vec<Fragment>> {
        let sql = format!(
            r#"
            SELECT {cols} FROM xml_fragments
            WHERE id IN (
                SELECT f.id
                FROM xml_fragments f
                JOIN zip_archives a ON f.zip_archive_id = a.id
                JOIN dataset_versions v ON v.source_url = a.url
                WHERE v.dataset_id = $1
                  AND (f.status = 'error' OR f.data_type IS DISTINCT FROM $2)
            )
            ORDER BY created_at
            "#,
            cols = FRAGMENT_COLUMNS
        );
        Ok(sqlx::query_as::<_, Fragment>(&sql)
            .bind(dataset_id)
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?)
    }

    async fn reset_fragment(&self, id: FragmentId) -> DbResult<u64> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query("DELETE FROM parsed_records WHERE xml_fragment_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let updated = sqlx::query(
            r#"
            UPDATE xml_fragments
            SET status = 'pending', records_count = 0, error_message = NULL, processed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Err(DbError::not_found("Fragment", id));
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn insert_records(&self, records: &[NewRecord]) -> DbResult<BatchOutcome> {
        if records.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut tx = self.pool.begin().await?;
        match Self::insert_batch_fast(&mut tx, records).await {
            Ok(inserted) => {
                tx.commit().await?;
                return Ok(BatchOutcome {
                    inserted,
                    skipped: 0,
                });
            },
            Err(e) => {
                warn!(error = %e, batch = records.len(), "Batch insert failed, retrying row by row");
                tx.rollback().await?;
            },
        }

        // Row-by-row inside savepoints so one bad row cannot sink its batch
        let mut outcome = BatchOutcome::default();
        let mut tx = self.pool.begin().await?;
        for record in records {
            let mut savepoint = Connection::begin(&mut *tx).await?;
            match Self::insert_one(&mut savepoint, record).await {
                Ok(()) => {
                    savepoint.commit().await?;
                    outcome.inserted += 1;
                },
                Err(e) => {
                    savepoint.rollback().await?;
                    outcome.skipped += 1;
                    warn!(
                        error = %e,
                        record_key = record.key.as_deref().unwrap_or("-"),
                        "Skipping record that failed to insert"
                    );
                },
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn append_log(&self, entry: &NewLogEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO operation_log (sync_run_id, operation_type, message, level, stage)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.run_id)
        .bind(&entry.category)
        .bind(&entry.message)
        .bind(entry.level.as_str())
        .bind(entry.stage.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_settings(&self) -> DbResult<HashMap<String, String>> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM robot_settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(archive: &Archive, fragment: &Fragment, key: &str) -> NewRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("guid".to_string(), json!(key));
        NewRecord {
            archive_id: archive.id,
            fragment_id: fragment.id,
            kind: RecordKind::Plan,
            key: Some(key.to_string()),
            date: chrono::NaiveDate::from_ymd_opt(2024, 3, 1),
            payload,
            raw_xml: format!("<plan><guid>{}</guid></plan>", key),
        }
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_finish_run_honours_stop_flag(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let run = store.create_run(false).await?;
        assert_eq!(run.status, RunStatus::Running);

        assert!(store.request_stop(run.id).await?);
        assert!(store.request_stop(run.id).await?);
        assert!(store.is_stop_requested(run.id).await?);

        let counters = RunCounters {
            files_processed: 2,
            records_loaded: 40,
        };
        let written = store
            .finish_run(run.id, RunStatus::Completed, None, counters)
            .await?;
        assert_eq!(written, RunStatus::Stopped);

        let run = store.get_run(run.id).await?.unwrap();
        assert!(!run.stop_requested);
        assert_eq!(run.records_loaded, 40);
        assert_eq!(run.error_message.as_deref(), Some(STOPPED_BY_OPERATOR));
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_force_finished_run_is_not_reopened(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let run = store.create_run(false).await?;

        assert!(store.force_finish(run.id, "halted").await?);
        assert!(!store.force_finish(run.id, "halted again").await?);
        // The worker still sees the flag and winds down
        assert!(store.is_stop_requested(run.id).await?);

        let written = store
            .finish_run(run.id, RunStatus::Completed, None, RunCounters::default())
            .await?;
        assert_eq!(written, RunStatus::Stopped);
        let run = store.get_run(run.id).await?.unwrap();
        assert_eq!(run.error_message.as_deref(), Some("halted"));
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_request_stop_ignores_finished_runs(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let run = store.create_run(true).await?;
        store
            .finish_run(run.id, RunStatus::Completed, None, RunCounters::default())
            .await?;

        assert!(store.request_stop(run.id).await?);
        let run = store.get_run(run.id).await?.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(!run.stop_requested);

        assert!(!store.request_stop(uuid::Uuid::new_v4()).await?);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_reconcile_only_touches_stale_runs(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool.clone());
        let stale = store.create_run(false).await?;
        let stale_stopping = store.create_run(false).await?;
        let fresh = store.create_run(false).await?;

        sqlx::query("UPDATE sync_runs SET started_at = NOW() - INTERVAL '2 hours' WHERE id IN ($1, $2)")
            .bind(stale.id)
            .bind(stale_stopping.id)
            .execute(&pool)
            .await?;
        store.request_stop(stale_stopping.id).await?;

        let mut reconciled = store.reconcile_stale_runs(Duration::from_secs(3600)).await?;
        reconciled.sort_by_key(|r| r.status.as_str());
        assert_eq!(reconciled.len(), 2);
        assert!(reconciled
            .iter()
            .any(|r| r.id == stale.id && r.status == RunStatus::Aborted));
        assert!(reconciled
            .iter()
            .any(|r| r.id == stale_stopping.id && r.status == RunStatus::Stopped));

        let fresh = store.get_run(fresh.id).await?.unwrap();
        assert_eq!(fresh.status, RunStatus::Running);

        // A second pass finds nothing left to do
        assert!(store.reconcile_stale_runs(Duration::from_secs(3600)).await?.is_empty());
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_archive_lifecycle_and_hash_lookup(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let url = "https://example.test/data-1.zip";

        let first = store.register_archive(url, None).await?;
        let again = store.register_archive(url, None).await?;
        assert_eq!(first.id, again.id);
        assert_eq!(first.status, ArchiveStatus::Pending);

        store
            .mark_archive_downloaded(first.id, "/tmp/data-1.zip", 1024, "abc123")
            .await?;
        assert!(!store.processed_hash_exists("abc123", None).await?);

        store.mark_archive_processed(first.id).await?;
        assert!(store.processed_hash_exists("abc123", None).await?);
        assert!(!store.processed_hash_exists("abc123", Some(first.id)).await?);

        // Processed archives never move back into error
        store.mark_archive_error(first.id, "late failure").await?;
        let archive = store.get_archive(first.id).await?.unwrap();
        assert_eq!(archive.status, ArchiveStatus::Processed);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_insert_records_and_reset_fragment(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let archive = store
            .register_archive("https://example.test/data-2.zip", None)
            .await?;
        let fragment = store.create_fragment(archive.id, "data.xml").await?;
        assert_eq!(fragment.status, FragmentStatus::Parsing);

        let batch: Vec<_> = (0..5)
            .map(|i| record(&archive, &fragment, &format!("key-{}", i)))
            .collect();
        let outcome = store.insert_records(&batch).await?;
        assert_eq!(outcome, BatchOutcome { inserted: 5, skipped: 0 });

        store
            .finish_fragment(
                fragment.id,
                &FragmentOutcome::Loaded {
                    kind: RecordKind::Plan,
                    records: 5,
                },
            )
            .await?;
        let loaded = store.get_fragment(fragment.id).await?.unwrap();
        assert_eq!(loaded.status, FragmentStatus::Loaded);
        assert_eq!(loaded.kind(), Some(FragmentKind::Plan));
        assert_eq!(loaded.records_count, 5);

        assert_eq!(store.reset_fragment(fragment.id).await?, 5);
        let reset = store.get_fragment(fragment.id).await?.unwrap();
        assert_eq!(reset.status, FragmentStatus::Pending);
        assert_eq!(reset.records_count, 0);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_insert_records_skips_bad_rows(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let archive = store
            .register_archive("https://example.test/data-3.zip", None)
            .await?;
        let fragment = store.create_fragment(archive.id, "data.xml").await?;

        let mut batch = vec![
            record(&archive, &fragment, "good-1"),
            record(&archive, &fragment, "bad"),
            record(&archive, &fragment, "good-2"),
        ];
        // Dangling fragment reference violates the foreign key
        batch[1].fragment_id = uuid::Uuid::new_v4();

        let outcome = store.insert_records(&batch).await?;
        assert_eq!(outcome, BatchOutcome { inserted: 2, skipped: 1 });
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_dataset_upsert_keeps_classification(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let mut new = NewDataset {
            identifier: "7710146102-plan-2024".to_string(),
            title: "Plans".to_string(),
            link: "https://example.test/meta".to_string(),
            kind: Some(RecordKind::Plan),
        };
        let first = store.upsert_dataset(&new).await?;

        new.kind = None;
        new.title = "Plans (renamed)".to_string();
        let second = store.upsert_dataset(&new).await?;
        assert_eq!(first.id, second.id);
        assert_eq!(second.kind(), Some(RecordKind::Plan));
        assert_eq!(second.title, "Plans (renamed)");

        let version = NewDatasetVersion {
            dataset_id: second.id,
            source_url: "https://example.test/data-1.zip".to_string(),
            created: "2024-01-01".to_string(),
            provenance: String::new(),
            structure: "1.0".to_string(),
        };
        assert!(store.insert_version(&version).await?);
        assert!(!store.insert_version(&version).await?);
        Ok(())
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_delete_run_detaches_archives(pool: PgPool) -> DbResult<()> {
        let store = PgSyncStore::new(pool);
        let run = store.create_run(true).await?;
        let archive = store
            .register_archive("manual://kept.zip", Some(run.id))
            .await?;
        store
            .append_log(&NewLogEntry {
                run_id: Some(run.id),
                category: "manual".to_string(),
                message: "Processing file kept.zip".to_string(),
                level: LogSeverity::Info,
                stage: LogStage::General,
            })
            .await?;

        let deleted = store.delete_run(run.id).await?;
        assert_eq!(deleted.archives_detached, 1);
        assert_eq!(deleted.logs_deleted, 1);
        assert!(store.get_run(run.id).await?.is_none());
        assert_eq!(store.get_archive(archive.id).await?.unwrap().sync_run_id, None);

        assert!(matches!(
            store.delete_run(run.id).await,
            Err(DbError::NotFound(_))
        ));
        Ok(())
    }
}
