//! SQLite-backed vector index.
//!
//! Chunks and their embedding vectors live in two tables joined by chunk id.
//! Vectors are stored as little-endian f32 BLOBs and scored in Rust with a
//! brute-force cosine scan, which stays exact and fast enough for corpora in
//! the tens of thousands of chunks.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::chunk::Chunk;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{RagError, Result};

use super::{rank_hits, DocumentRecord, IndexEntry, SearchHit, VectorIndex};

pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(RagError::Db)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.migrate().await?;
        Ok(index)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                source_path TEXT NOT NULL,
                title TEXT NOT NULL,
                page_count INTEGER NOT NULL,
                chunk_count INTEGER NOT NULL,
                ingested_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                page INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                hash TEXT NOT NULL,
                UNIQUE(document_id, chunk_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_vectors (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document ON chunk_vectors(document_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Chunk {
        Chunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            index: row.get::<i64, _>("chunk_index") as usize,
            page: row.get::<i64, _>("page") as usize,
            text: row.get("text"),
            token_count: row.get::<i64, _>("token_count") as usize,
            start_offset: row.get::<i64, _>("start_offset") as usize,
            end_offset: row.get::<i64, _>("end_offset") as usize,
            hash: row.get("hash"),
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn upsert(&self, entry: &IndexEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let c = &entry.chunk;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO chunks
                (id, document_id, chunk_index, page, text, token_count,
                 start_offset, end_offset, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&c.id)
        .bind(&c.document_id)
        .bind(c.index as i64)
        .bind(c.page as i64)
        .bind(&c.text)
        .bind(c.token_count as i64)
        .bind(c.start_offset as i64)
        .bind(c.end_offset as i64)
        .bind(&c.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
        )
        .bind(&c.id)
        .bind(&c.document_id)
        .bind(vec_to_blob(&entry.vector))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_document(&self, record: &DocumentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO documents
                (id, source_path, title, page_count, chunk_count, ingested_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.source_path)
        .bind(&record.title)
        .bind(record.page_count as i64)
        .bind(record.chunk_count as i64)
        .bind(record.ingested_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(
            "SELECT id, source_path, title, page_count, chunk_count, ingested_at \
             FROM documents WHERE id = ?",
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| DocumentRecord {
            id: row.get("id"),
            source_path: row.get("source_path"),
            title: row.get("title"),
            page_count: row.get::<i64, _>("page_count") as usize,
            chunk_count: row.get::<i64, _>("chunk_count") as usize,
            ingested_at: chrono::DateTime::from_timestamp(row.get::<i64, _>("ingested_at"), 0)
                .unwrap_or_default(),
        }))
    }

    async fn delete_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        document_filter: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        // LEFT JOIN so a vector whose chunk row went missing is visible as
        // corruption instead of silently dropped.
        let sql = match document_filter {
            Some(_) => {
                r#"
                SELECT cv.chunk_id, cv.embedding, c.id AS backing_id
                FROM chunk_vectors cv
                LEFT JOIN chunks c ON c.id = cv.chunk_id
                WHERE cv.document_id = ?
                "#
            }
            None => {
                r#"
                SELECT cv.chunk_id, cv.embedding, c.id AS backing_id
                FROM chunk_vectors cv
                LEFT JOIN chunks c ON c.id = cv.chunk_id
                "#
            }
        };

        let mut q = sqlx::query(sql);
        if let Some(doc) = document_filter {
            q = q.bind(doc);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk_id: String = row.get("chunk_id");
            let backing: Option<String> = row.get("backing_id");
            if backing.is_none() {
                return Err(RagError::IndexCorruption(format!(
                    "vector for chunk {chunk_id} has no backing chunk row"
                )));
            }
            let blob: Vec<u8> = row.get("embedding");
            hits.push(SearchHit {
                chunk_id,
                score: cosine_similarity(query, &blob_to_vec(&blob)),
            });
        }

        Ok(rank_hits(hits, k))
    }

    async fn chunk(&self, chunk_id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(
            r#"
            SELECT id, document_id, chunk_index, page, text, token_count,
                   start_offset, end_offset, hash
            FROM chunks WHERE id = ?
            "#,
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::chunk_from_row))
    }

    async fn entry_count(&self) -> Result<usize> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n") as usize)
    }
}
