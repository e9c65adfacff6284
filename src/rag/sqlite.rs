//! SQLite-backed fragment store.
//!
//! Fragment metadata lives in SQLite. Semantic search is a brute-force
//! cosine scan over the scope's embeddings; lexical search pre-filters with
//! `LIKE` and ranks by term coverage.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::scoring::{cosine_similarity, keyword_score, query_terms};
use super::store::{Candidate, EmbeddingStore, StoreError};
use super::types::{KnowledgeFragment, RetrievedFragment, SourceMetadata};

const FRAGMENT_COLUMNS: &str = "fragment_id, scope_id, content, labels, document_id, \
     source_title, source_url, source_updated_at";

pub struct SqliteFragmentStore {
    pool: SqlitePool,
    db_path: PathBuf,
}

impl SqliteFragmentStore {
    pub async fn open(db_path: PathBuf) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(StoreError::unavailable)?;

        let store = Self { pool, db_path };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &PathBuf {
        &self.db_path
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS fragments (
                fragment_id TEXT PRIMARY KEY,
                scope_id TEXT NOT NULL,
                content TEXT NOT NULL,
                labels TEXT NOT NULL DEFAULT '[]',
                document_id TEXT NOT NULL,
                source_title TEXT NOT NULL DEFAULT '',
                source_url TEXT,
                source_updated_at TEXT NOT NULL,
                embedding BLOB,
                ingested_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now'))
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::unavailable)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_fragments_scope ON fragments(scope_id)")
            .execute(&self.pool)
            .await
            .map_err(StoreError::unavailable)?;

        Ok(())
    }

    /// Seed or re-ingest fragments. A fragment with an existing id is replaced.
    pub async fn upsert(&self, fragments: &[KnowledgeFragment]) -> Result<(), StoreError> {
        if fragments.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::unavailable)?;

        for fragment in fragments {
            let labels = serde_json::to_string(&fragment.labels)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?;

            sqlx::query(
                "INSERT OR REPLACE INTO fragments (fragment_id, scope_id, content, labels, document_id,
                    source_title, source_url, source_updated_at, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(&fragment.id)
            .bind(&fragment.scope_id)
            .bind(&fragment.text)
            .bind(&labels)
            .bind(&fragment.source.document_id)
            .bind(&fragment.source.title)
            .bind(&fragment.source.url)
            .bind(fragment.source.updated_at.to_rfc3339())
            .bind(serialize_embedding(&fragment.embedding))
            .execute(&mut *tx)
            .await
            .map_err(StoreError::unavailable)?;
        }

        tx.commit().await.map_err(StoreError::unavailable)?;
        Ok(())
    }

    pub async fn count(&self, scope_id: Option<&str>) -> Result<usize, StoreError> {
        let count: i64 = if let Some(scope_id) = scope_id {
            sqlx::query_scalar("SELECT COUNT(*) FROM fragments WHERE scope_id = ?1")
                .bind(scope_id)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::unavailable)?
        } else {
            sqlx::query_scalar("SELECT COUNT(*) FROM fragments")
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::unavailable)?
        };

        Ok(count as usize)
    }
}

fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn row_to_fragment(row: &sqlx::sqlite::SqliteRow) -> Result<RetrievedFragment, StoreError> {
    let labels_str: String = row.get("labels");
    let labels = serde_json::from_str::<Vec<String>>(&labels_str).unwrap_or_default();

    let updated_str: String = row.get("source_updated_at");
    let updated_at = DateTime::parse_from_rfc3339(&updated_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("source_updated_at '{}': {}", updated_str, e)))?;

    Ok(RetrievedFragment {
        id: row.get("fragment_id"),
        text: row.get("content"),
        source: SourceMetadata {
            document_id: row.get("document_id"),
            title: row.get("source_title"),
            url: row.get("source_url"),
            updated_at,
        },
        labels,
        scope_id: row.get("scope_id"),
    })
}

fn best_first(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.raw_score
            .total_cmp(&a.raw_score)
            .then_with(|| a.fragment.id.cmp(&b.fragment.id))
    });
    candidates.truncate(limit);
    candidates
}

#[async_trait]
impl EmbeddingStore for SqliteFragmentStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn semantic_search(
        &self,
        embedding: &[f32],
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {}, embedding FROM fragments WHERE scope_id = ?1 AND embedding IS NOT NULL",
            FRAGMENT_COLUMNS
        ))
        .bind(scope_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::unavailable)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let bytes: Vec<u8> = row.get("embedding");
            if bytes.is_empty() {
                continue;
            }
            let score = cosine_similarity(embedding, &deserialize_embedding(&bytes));
            if score <= 0.0 {
                continue;
            }
            candidates.push(Candidate {
                fragment: row_to_fragment(row)?,
                raw_score: score,
            });
        }

        Ok(best_first(candidates, limit))
    }

    async fn lexical_search(
        &self,
        text: &str,
        scope_id: &str,
        limit: usize,
    ) -> Result<Vec<Candidate>, StoreError> {
        let terms = query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM fragments WHERE scope_id = ",
            FRAGMENT_COLUMNS
        ));
        builder.push_bind(scope_id);
        builder.push(" AND (");
        let mut separated = builder.separated(" OR ");
        for term in &terms {
            separated.push("content LIKE ");
            separated.push_bind_unseparated(format!("%{}%", term));
        }
        builder.push(")");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::unavailable)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let fragment = row_to_fragment(row)?;
            let score = keyword_score(&terms, &fragment.text);
            if score > 0.0 {
                candidates.push(Candidate {
                    fragment,
                    raw_score: score,
                });
            }
        }

        Ok(best_first(candidates, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::types::fixtures::source;

    async fn test_store() -> (tempfile::TempDir, SqliteFragmentStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteFragmentStore::open(tmp.path().join("fragments.db"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn make_fragment(id: &str, scope: &str, text: &str, embedding: Vec<f32>) -> KnowledgeFragment {
        KnowledgeFragment {
            id: id.to_string(),
            text: text.to_string(),
            embedding,
            source: source(id, 3),
            labels: vec!["audio".to_string()],
            scope_id: scope.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_and_semantic_search() {
        let (_tmp, store) = test_store().await;

        store
            .upsert(&[
                make_fragment("f1", "s1", "Hello world", vec![1.0, 0.0, 0.0]),
                make_fragment("f2", "s1", "Other", vec![0.0, 1.0, 0.0]),
                make_fragment("f3", "s2", "Hello world", vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();
        assert_eq!(store.count(None).await.unwrap(), 3);
        assert_eq!(store.count(Some("s1")).await.unwrap(), 2);

        let results = store.semantic_search(&[1.0, 0.0, 0.0], "s1", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].fragment.id, "f1");
        assert!(results[0].raw_score > 0.99);
        assert_eq!(results[0].fragment.labels, vec!["audio".to_string()]);
        assert_eq!(results[0].fragment.source, source("f1", 3));
    }

    #[tokio::test]
    async fn lexical_search_ranks_by_term_coverage() {
        let (_tmp, store) = test_store().await;

        store
            .upsert(&[
                make_fragment("f1", "s1", "Rust memory safety without garbage collection", vec![1.0]),
                make_fragment("f2", "s1", "Memory tips for Python", vec![1.0]),
                make_fragment("f3", "s1", "Unrelated text", vec![1.0]),
            ])
            .await
            .unwrap();

        let results = store
            .lexical_search("rust memory safety", "s1", 10)
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|c| c.fragment.id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2"]);
        assert!((results[0].raw_score - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn reingestion_replaces_fragment() {
        let (_tmp, store) = test_store().await;

        store
            .upsert(&[make_fragment("f1", "s1", "first version", vec![1.0])])
            .await
            .unwrap();
        store
            .upsert(&[make_fragment("f1", "s1", "second version", vec![1.0])])
            .await
            .unwrap();

        assert_eq!(store.count(Some("s1")).await.unwrap(), 1);
        let hits = store.lexical_search("second", "s1", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
