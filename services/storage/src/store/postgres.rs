use super::{check_document, describe_filters, CollectionStats, EventStore, IndexDescriptor};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::event::{ClassCountSnapshot, Detection, DetectionEvent, EventId, ModelInfo, StoredEvent};
use crate::statistics::{sort_class_statistics, ClassStatistics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Longest table name whose derived index names still fit Postgres' 63-byte
/// identifier limit.
const MAX_TABLE_NAME_LEN: usize = 39;

/// Row shape of the event table.
#[derive(Debug, FromRow)]
struct EventRow {
    id: Uuid,
    timestamp: DateTime<Utc>,
    source_id: String,
    frame_number: i64,
    processed_frame_number: i64,
    total_objects_detected: i64,
    object_counts: Json<ClassCountSnapshot>,
    detections: Json<Vec<Detection>>,
    model_info: Json<ModelInfo>,
}

impl EventRow {
    fn into_stored(self) -> Result<StoredEvent, String> {
        let to_u64 = |column: &str, value: i64| {
            u64::try_from(value).map_err(|_| format!("negative {} in row {}", column, self.id))
        };
        let event = DetectionEvent {
            timestamp: self.timestamp,
            frame_number: to_u64("frame_number", self.frame_number)?,
            processed_frame_number: to_u64("processed_frame_number", self.processed_frame_number)?,
            total_objects_detected: to_u64("total_objects_detected", self.total_objects_detected)?,
            source_id: self.source_id,
            object_counts: self.object_counts.0,
            detections: self.detections.0,
            model_info: self.model_info.0,
        };
        Ok(StoredEvent { id: self.id, event })
    }
}

/// PostgreSQL-backed event store. Each event is one row; nested parts of the
/// document are JSONB columns so class statistics can be pushed down.
pub struct PgEventStore {
    pool: PgPool,
    table: String,
    database_name: String,
    max_document_bytes: usize,
}

impl PgEventStore {
    /// Connect the pool and make sure the event table exists.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        validate_table_name(&config.table)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(|e| StoreError::StoreUnavailable(format!("connect failed: {}", e)))?;

        info!(
            database = %config.database_name(),
            table = %config.table,
            "Connected to PostgreSQL database"
        );

        let store = Self {
            pool,
            table: config.table.clone(),
            database_name: config.database_name(),
            max_document_bytes: config.max_document_bytes,
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                source_id TEXT NOT NULL,
                frame_number BIGINT NOT NULL CHECK (frame_number >= 1),
                processed_frame_number BIGINT NOT NULL CHECK (processed_frame_number >= 1),
                total_objects_detected BIGINT NOT NULL CHECK (total_objects_detected >= 0),
                object_counts JSONB NOT NULL,
                detections JSONB NOT NULL,
                model_info JSONB NOT NULL
            )
            "#,
            table = self.table
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::StoreUnavailable(format!("schema setup failed: {}", e)))?;
        Ok(())
    }

    fn index_statements(&self) -> Vec<(String, String)> {
        let table = &self.table;
        [
            ("timestamp_desc_idx", "(timestamp DESC)"),
            ("source_id_idx", "(source_id)"),
            ("frame_number_idx", "(frame_number)"),
            ("source_id_timestamp_idx", "(source_id, timestamp DESC)"),
        ]
        .into_iter()
        .map(|(suffix, columns)| {
            let name = format!("{}_{}", table, suffix);
            let ddl = format!("CREATE INDEX IF NOT EXISTS {} ON {} {}", name, table, columns);
            (name, ddl)
        })
        .collect()
    }

    fn select_columns(&self) -> String {
        format!(
            "SELECT id, timestamp, source_id, frame_number, processed_frame_number, \
             total_objects_detected, object_counts, detections, model_info FROM {}",
            self.table
        )
    }

    async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &DetectionEvent,
    ) -> Result<EventId, StoreError> {
        let id = Uuid::new_v4();
        let sql = format!(
            r#"
            INSERT INTO {} (
                id, timestamp, source_id, frame_number, processed_frame_number,
                total_objects_detected, object_counts, detections, model_info
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
            self.table
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(event.timestamp)
            .bind(&event.source_id)
            .bind(event.frame_number as i64)
            .bind(event.processed_frame_number as i64)
            .bind(event.total_objects_detected as i64)
            .bind(Json(&event.object_counts))
            .bind(Json(&event.detections))
            .bind(Json(&event.model_info))
            .execute(&mut **tx)
            .await
            .map_err(classify_write)?;
        Ok(id)
    }

    async fn fetch_events(
        &self,
        operation: &'static str,
        filters: String,
        query: sqlx::query::QueryAs<'_, Postgres, EventRow, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let mut rows = query.fetch(&self.pool);
        let mut events = Vec::new();
        while let Some(row) = rows.next().await {
            let row = row.map_err(|e| classify_read(operation, &filters, e))?;
            let event = row
                .into_stored()
                .map_err(|reason| StoreError::query_failed(operation, filters.clone(), reason))?;
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let mut failed = Vec::new();
        for (name, ddl) in self.index_statements() {
            match sqlx::query(&ddl).execute(&self.pool).await {
                Ok(_) => debug!(index = %name, "Index ensured"),
                Err(e) => {
                    warn!(index = %name, error = %e, "Failed to create index");
                    failed.push(name);
                }
            }
        }

        if failed.is_empty() {
            info!("Event store indexes ready");
            Ok(())
        } else {
            Err(StoreError::IndexCreationFailed(failed))
        }
    }

    #[instrument(
        skip(self, event),
        fields(source_id = %event.source_id, frame_number = event.frame_number)
    )]
    async fn persist(&self, event: &DetectionEvent) -> Result<EventId, StoreError> {
        check_document(event, self.max_document_bytes)?;

        let mut tx = self.pool.begin().await.map_err(classify_write)?;
        let id = self.insert(&mut tx, event).await?;
        tx.commit().await.map_err(classify_write)?;

        debug!(event_id = %id, "Detection event stored");
        Ok(id)
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn persist_many(&self, events: &[DetectionEvent]) -> Result<Vec<EventId>, StoreError> {
        for event in events {
            check_document(event, self.max_document_bytes)?;
        }

        let mut tx = self.pool.begin().await.map_err(classify_write)?;
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            ids.push(self.insert(&mut tx, event).await?);
        }
        tx.commit().await.map_err(classify_write)?;

        debug!(count = ids.len(), "Detection events stored in batch");
        Ok(ids)
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!("{} ORDER BY timestamp DESC LIMIT $1", self.select_columns());
        let query = sqlx::query_as::<_, EventRow>(&sql).bind(clamp_limit(limit));
        self.fetch_events("query_recent", format!("limit={}", limit), query)
            .await
    }

    #[instrument(skip(self))]
    async fn query_by_source(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            "{} WHERE source_id = $1 ORDER BY timestamp DESC LIMIT $2",
            self.select_columns()
        );
        let query = sqlx::query_as::<_, EventRow>(&sql)
            .bind(source_id)
            .bind(clamp_limit(limit));
        let filters = describe_filters(&[
            ("source_id", Some(source_id.to_string())),
            ("limit", Some(limit.to_string())),
        ]);
        self.fetch_events("query_by_source", filters, query).await
    }

    #[instrument(skip(self))]
    async fn query_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            r#"{}
            WHERE timestamp >= $1 AND timestamp <= $2
              AND ($3::text IS NULL OR source_id = $3)
            ORDER BY timestamp DESC"#,
            self.select_columns()
        );
        let query = sqlx::query_as::<_, EventRow>(&sql)
            .bind(start)
            .bind(end)
            .bind(source_id);
        let filters = describe_filters(&[
            ("start", Some(start.to_rfc3339())),
            ("end", Some(end.to_rfc3339())),
            ("source_id", source_id.map(str::to_string)),
        ]);
        self.fetch_events("query_by_time_range", filters, query)
            .await
    }

    async fn query_by_frame_number(
        &self,
        frame_number: u64,
        source_id: Option<&str>,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let sql = format!(
            r#"{}
            WHERE frame_number = $1
              AND ($2::text IS NULL OR source_id = $2)
            ORDER BY timestamp DESC"#,
            self.select_columns()
        );
        let query = sqlx::query_as::<_, EventRow>(&sql)
            .bind(frame_number as i64)
            .bind(source_id);
        let filters = describe_filters(&[
            ("frame_number", Some(frame_number.to_string())),
            ("source_id", source_id.map(str::to_string)),
        ]);
        self.fetch_events("query_by_frame_number", filters, query)
            .await
    }

    #[instrument(skip(self))]
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE timestamp < $1", self.table);
        let result = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                let filters = format!("cutoff={}", cutoff.to_rfc3339());
                classify_read("purge_older_than", &filters, e)
            })?;

        let deleted = result.rows_affected();
        info!(deleted_count = deleted, before = %cutoff, "Deleted old detection events");
        Ok(deleted)
    }

    async fn collection_stats(&self) -> Result<CollectionStats, StoreError> {
        let count_sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let (total,): (i64,) = sqlx::query_as(&count_sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_read("collection_stats", "no filters", e))?;

        let indexes: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT indexname, indexdef FROM pg_indexes
            WHERE tablename = $1
            ORDER BY indexname
            "#,
        )
        .bind(&self.table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_read("collection_stats", "no filters", e))?;

        Ok(CollectionStats {
            total_documents: total.max(0) as u64,
            database_name: self.database_name.clone(),
            table_name: self.table.clone(),
            indexes: indexes
                .into_iter()
                .map(|(name, definition)| IndexDescriptor { name, definition })
                .collect(),
        })
    }

    #[instrument(skip(self))]
    async fn class_statistics(
        &self,
        source_id: Option<&str>,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        let sql = format!(
            r#"
            SELECT d->>'class_name' AS class_name,
                   COUNT(*)::bigint AS total_count,
                   AVG((d->>'confidence')::float8) AS avg_confidence,
                   MIN((d->>'confidence')::float8) AS min_confidence,
                   MAX((d->>'confidence')::float8) AS max_confidence
            FROM {} e
            CROSS JOIN LATERAL jsonb_array_elements(e.detections) AS d
            WHERE ($1::text IS NULL OR e.source_id = $1)
            GROUP BY d->>'class_name'
            ORDER BY total_count DESC, class_name ASC
            "#,
            self.table
        );
        let rows: Vec<(String, i64, f64, f64, f64)> = sqlx::query_as(&sql)
            .bind(source_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                let filters = describe_filters(&[("source_id", source_id.map(str::to_string))]);
                classify_read("class_statistics", &filters, e)
            })?;

        let mut stats: Vec<ClassStatistics> = rows
            .into_iter()
            .map(|(class_name, total, avg, min, max)| ClassStatistics {
                class_name,
                total_count: total.max(0) as u64,
                avg_confidence: avg,
                min_confidence: min,
                max_confidence: max,
            })
            .collect();
        // Collation of class_name may differ from byte order.
        sort_class_statistics(&mut stats);
        Ok(stats)
    }

    async fn class_totals(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ClassCountSnapshot, StoreError> {
        let sql = format!(
            r#"
            SELECT c.key, SUM(c.value::bigint)::bigint
            FROM {} e
            CROSS JOIN LATERAL jsonb_each_text(e.object_counts) AS c
            WHERE e.timestamp >= $1 AND e.timestamp <= $2
            GROUP BY c.key
            "#,
            self.table
        );
        let rows: Vec<(String, i64)> = sqlx::query_as(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                let filters = describe_filters(&[
                    ("start", Some(start.to_rfc3339())),
                    ("end", Some(end.to_rfc3339())),
                ]);
                classify_read("class_totals", &filters, e)
            })?;

        Ok(rows
            .into_iter()
            .map(|(class_name, total)| (class_name, total.max(0) as u64))
            .collect())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL connection pool closed");
    }
}

fn clamp_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let mut chars = table.chars();
    let valid_start = chars
        .next()
        .map_or(false, |c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_start || !valid_rest || table.len() > MAX_TABLE_NAME_LEN {
        return Err(StoreError::StoreUnavailable(format!(
            "invalid table name: {:?}",
            table
        )));
    }
    Ok(())
}

fn is_connectivity(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}

fn classify_write(error: sqlx::Error) -> StoreError {
    if is_connectivity(&error) {
        StoreError::StoreUnavailable(error.to_string())
    } else {
        StoreError::WriteRejected(error.to_string())
    }
}

fn classify_read(operation: &'static str, filters: &str, error: sqlx::Error) -> StoreError {
    if is_connectivity(&error) {
        StoreError::StoreUnavailable(error.to_string())
    } else {
        StoreError::query_failed(operation, filters, error)
    }
}
