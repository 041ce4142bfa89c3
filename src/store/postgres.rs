//! PostgreSQL adapter: the authoritative store of record.
//!
//! One `records` table owns the canonical rows. Full-text search runs over a
//! generated tsvector column with a GIN index, ranked by `ts_rank`, always
//! scoped to one group inside the query.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::LexError;
use crate::record::{CanonicalRecord, RecordKind, SearchHit};
use crate::store::{RelationalStore, StoreKind};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    id UUID PRIMARY KEY,
    group_id TEXT NOT NULL DEFAULT 'default',
    kind TEXT NOT NULL DEFAULT 'event',
    date DATE,
    description TEXT NOT NULL,
    parties JSONB,
    tags JSONB,
    document_source TEXT,
    excerpts TEXT,
    significance TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    search_tsv TSVECTOR GENERATED ALWAYS AS (
        to_tsvector('english',
            coalesce(description, '') || ' ' ||
            coalesce(excerpts, '') || ' ' ||
            coalesce(significance, ''))
    ) STORED
);
CREATE INDEX IF NOT EXISTS idx_records_group ON records (group_id);
CREATE INDEX IF NOT EXISTS idx_records_tsv ON records USING GIN (search_tsv);
";

const RECORD_COLUMNS: &str = "id, group_id, kind, date, description, parties, tags, \
     document_source, excerpts, significance, created_at, updated_at";

/// Pooled Postgres-backed store.
pub struct PostgresStore {
    pool: Pool,
    acquire_timeout_ms: u64,
}

impl PostgresStore {
    pub fn new(config: &DatabaseConfig) -> Result<Self, LexError> {
        let pg_config: tokio_postgres::Config = config
            .postgres_url
            .parse()
            .map_err(|e: tokio_postgres::Error| {
                LexError::Pool(format!("invalid postgres url: {e}"))
            })?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_max_size)
            .wait_timeout(Some(config.pool_acquire_timeout))
            .create_timeout(Some(config.pool_acquire_timeout))
            .recycle_timeout(Some(config.pool_acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| LexError::Pool(e.to_string()))?;
        Ok(Self {
            pool,
            acquire_timeout_ms: config.pool_acquire_timeout.as_millis() as u64,
        })
    }

    /// Apply the schema. Safe to run on every startup.
    pub async fn ensure_schema(&self) -> Result<(), LexError> {
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| store_err(format!("schema setup failed: {e}")))?;
        Ok(())
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, LexError> {
        self.pool.get().await.map_err(|e| match e {
            deadpool_postgres::PoolError::Timeout(_) => LexError::Timeout {
                store: StoreKind::Relational,
                timeout_ms: self.acquire_timeout_ms,
            },
            other => LexError::Pool(other.to_string()),
        })
    }
}

fn store_err(message: impl Into<String>) -> LexError {
    LexError::StoreUnavailable {
        store: StoreKind::Relational,
        message: message.into(),
    }
}

/// Ids are opaque strings at the API surface but UUIDs in the table; a
/// string that is not a UUID cannot name a row.
fn parse_id(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id).ok()
}

fn row_to_record(row: &tokio_postgres::Row) -> Result<CanonicalRecord, LexError> {
    let kind_raw: String = row.get("kind");
    let kind = RecordKind::from_db_value(&kind_raw)
        .ok_or_else(|| LexError::Serialization(format!("unknown record kind '{kind_raw}'")))?;
    Ok(CanonicalRecord {
        id: row.get::<_, Uuid>("id").to_string(),
        group_id: row.get("group_id"),
        kind,
        date: row.get::<_, Option<NaiveDate>>("date"),
        description: row.get("description"),
        parties: json_to_list(row.get::<_, Option<serde_json::Value>>("parties")),
        tags: json_to_list(row.get::<_, Option<serde_json::Value>>("tags")),
        document_source: row.get("document_source"),
        excerpts: row.get("excerpts"),
        significance: row.get("significance"),
        created_at: row.get::<_, DateTime<Utc>>("created_at"),
        updated_at: row.get::<_, DateTime<Utc>>("updated_at"),
    })
}

fn json_to_list(value: Option<serde_json::Value>) -> Option<Vec<String>> {
    value.and_then(|value| {
        value.as_array().map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
    })
}

fn list_to_json(list: &Option<Vec<String>>) -> Option<serde_json::Value> {
    list.as_ref().map(|items| serde_json::json!(items))
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn upsert(&self, record: &CanonicalRecord) -> Result<(), LexError> {
        let id = parse_id(&record.id)
            .ok_or_else(|| LexError::Validation(format!("invalid record id '{}'", record.id)))?;
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO records (id, group_id, kind, date, description, parties, tags, \
                     document_source, excerpts, significance, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (id) DO UPDATE SET \
                     group_id = EXCLUDED.group_id, \
                     kind = EXCLUDED.kind, \
                     date = EXCLUDED.date, \
                     description = EXCLUDED.description, \
                     parties = EXCLUDED.parties, \
                     tags = EXCLUDED.tags, \
                     document_source = EXCLUDED.document_source, \
                     excerpts = EXCLUDED.excerpts, \
                     significance = EXCLUDED.significance, \
                     updated_at = EXCLUDED.updated_at",
                &[
                    &id,
                    &record.group_id,
                    &record.kind.as_str(),
                    &record.date,
                    &record.description,
                    &list_to_json(&record.parties),
                    &list_to_json(&record.tags),
                    &record.document_source,
                    &record.excerpts,
                    &record.significance,
                    &record.created_at,
                    &record.updated_at,
                ],
            )
            .await
            .map_err(|e| store_err(format!("upsert failed: {e}")))?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<CanonicalRecord>, LexError> {
        let Some(id) = parse_id(id) else {
            return Ok(None);
        };
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!("SELECT {RECORD_COLUMNS} FROM records WHERE id = $1").as_str(),
                &[&id],
            )
            .await
            .map_err(|e| store_err(format!("get failed: {e}")))?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(
        &self,
        group_id: &str,
        kind: Option<RecordKind>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CanonicalRecord>, LexError> {
        let client = self.client().await?;
        let kind_filter = if kind.is_some() { "AND kind = $4" } else { "" };
        let statement = format!(
            "SELECT {RECORD_COLUMNS} FROM records \
             WHERE group_id = $1 {kind_filter} \
             ORDER BY date ASC NULLS LAST, id ASC \
             LIMIT $2 OFFSET $3"
        );
        let limit = limit as i64;
        let offset = offset as i64;
        let rows = match kind {
            Some(kind) => {
                client
                    .query(
                        statement.as_str(),
                        &[&group_id, &limit, &offset, &kind.as_str()],
                    )
                    .await
            }
            None => {
                client
                    .query(statement.as_str(), &[&group_id, &limit, &offset])
                    .await
            }
        }
        .map_err(|e| store_err(format!("list failed: {e}")))?;
        rows.iter().map(row_to_record).collect()
    }

    async fn delete(&self, id: &str) -> Result<bool, LexError> {
        let Some(id) = parse_id(id) else {
            return Ok(false);
        };
        let client = self.client().await?;
        let deleted = client
            .execute("DELETE FROM records WHERE id = $1", &[&id])
            .await
            .map_err(|e| store_err(format!("delete failed: {e}")))?;
        Ok(deleted > 0)
    }

    async fn text_search(
        &self,
        query: &str,
        group_id: &str,
        limit: usize,
    ) -> Result<Vec<SearchHit>, LexError> {
        let client = self.client().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {RECORD_COLUMNS}, \
                         ts_rank(search_tsv, websearch_to_tsquery('english', $1)) AS rank \
                     FROM records \
                     WHERE group_id = $2 \
                       AND search_tsv @@ websearch_to_tsquery('english', $1) \
                     ORDER BY rank DESC, id ASC \
                     LIMIT $3"
                )
                .as_str(),
                &[&query, &group_id, &(limit as i64)],
            )
            .await
            .map_err(|e| store_err(format!("text search failed: {e}")))?;

        rows.iter()
            .map(|row| {
                let record = row_to_record(row)?;
                Ok(SearchHit {
                    id: record.id.clone(),
                    store: StoreKind::Relational,
                    raw_score: f64::from(row.get::<_, f32>("rank")),
                    payload: record.payload(),
                    updated_at: Some(record.updated_at),
                })
            })
            .collect()
    }

    async fn probe(&self) -> Result<(), LexError> {
        let client = self.client().await?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| store_err(format!("probe failed: {e}")))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close();
    }
}

// Connection-requiring behavior is covered by the in-memory adapter tests
// and the integration suite; what is testable offline is the id mapping.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_uuid_ids_cannot_name_a_row() {
        assert!(parse_id("not-a-uuid").is_none());
        assert!(parse_id("").is_none());
        assert!(parse_id(&Uuid::new_v4().to_string()).is_some());
    }

    #[test]
    fn json_list_round_trip() {
        let list = Some(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(json_to_list(list_to_json(&list)), list);
        assert_eq!(json_to_list(None), None);
    }
}
