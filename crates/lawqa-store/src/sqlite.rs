//! SQLite-based passage store.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::{debug, info};

use lawqa_core::{
    DatabaseConfig, LexicalField, Passage, PassageStore, QaError, Result, ScoreOrigin,
    ScoredCandidate, Stats,
};

use crate::schema::{SCHEMA, SCHEMA_VERSION};
use crate::vector::{bytes_to_vec, cosine_similarity, top_k, vec_to_bytes};

const PASSAGE_COLUMNS: &str = "id, law, chapter, section, article_no, article_title, clause_no, \
                               point, clause_head, text, enriched_text, citation, embedding";

/// SQLite store with FTS5 lexical search and exact cosine vector search.
///
/// Lexical ranking uses FTS5's `bm25()`. Dense ranking scans every stored
/// embedding; the statute corpus is a few thousand passages, so an exact
/// scan stays well inside the search timeout.
pub struct SqliteStore {
    /// Connection wrapped in blocking Mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(path, 30000)
    }

    /// Open the database described by the configuration.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open_with_timeout(&config.path, config.busy_timeout_ms)
    }

    fn open_with_timeout(path: impl AsRef<Path>, busy_timeout_ms: u32) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| QaError::database(format!("Failed to open database: {}", e)))?;

        Self::init(conn, path, busy_timeout_ms)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            QaError::database(format!("Failed to open in-memory database: {}", e))
        })?;

        Self::init(conn, Path::new(":memory:"), 30000)
    }

    /// Initialize the store with a connection.
    fn init(conn: Connection, path: &Path, busy_timeout_ms: u32) -> Result<Self> {
        Self::configure_connection(&conn, busy_timeout_ms)?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| QaError::database(format!("Failed to initialize schema: {}", e)))?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|e| QaError::database(format!("Failed to set schema version: {}", e)))?;

        info!("Passage database opened at {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Configure SQLite connection for read-heavy workloads.
    fn configure_connection(conn: &Connection, busy_timeout_ms: u32) -> Result<()> {
        conn.execute_batch(&format!(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA busy_timeout = {};
            PRAGMA temp_store = MEMORY;
            "#,
            busy_timeout_ms
        ))
        .map_err(|e| QaError::database(format!("Failed to configure connection: {}", e)))?;

        Ok(())
    }

    /// Run a blocking operation on the connection in the blocking pool.
    ///
    /// The caller's future stays cancellable, so a timeout around a search
    /// fires even while SQLite is busy.
    async fn with_conn<F, R>(&self, operation: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> Result<R> {
            let conn = conn
                .lock()
                .map_err(|e| QaError::store_unavailable(operation, e.to_string()))?;
            f(&conn)
        })
        .await
        .map_err(|e| QaError::store_unavailable(operation, format!("Store task failed: {}", e)))?
    }
}

#[async_trait]
impl PassageStore for SqliteStore {
    async fn insert_passages(&self, passages: &[Passage]) -> Result<()> {
        for passage in passages {
            passage.validate()?;
        }

        let passages = passages.to_vec();
        self.with_conn("insert", move |conn| {
            let tx = conn
                .unchecked_transaction()
                .map_err(|e| QaError::database(e.to_string()))?;

            {
                let mut stmt = tx
                    .prepare(
                        r#"
                        INSERT INTO passages (id, law, chapter, section, article_no, article_title,
                                              clause_no, point, clause_head, text, enriched_text,
                                              citation, embedding)
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                        ON CONFLICT(id) DO UPDATE SET
                            law = excluded.law,
                            chapter = excluded.chapter,
                            section = excluded.section,
                            article_no = excluded.article_no,
                            article_title = excluded.article_title,
                            clause_no = excluded.clause_no,
                            point = excluded.point,
                            clause_head = excluded.clause_head,
                            text = excluded.text,
                            enriched_text = excluded.enriched_text,
                            citation = excluded.citation,
                            embedding = excluded.embedding
                        "#,
                    )
                    .map_err(|e| QaError::database(e.to_string()))?;

                for passage in &passages {
                    let embedding = if passage.embedding.is_empty() {
                        None
                    } else {
                        Some(vec_to_bytes(&passage.embedding))
                    };
                    stmt.execute(params![
                        passage.id,
                        passage.law,
                        passage.chapter,
                        passage.section,
                        passage.article_no,
                        passage.article_title,
                        passage.clause_no,
                        passage.point,
                        passage.clause_head,
                        passage.text,
                        passage.enriched_text,
                        passage.citation,
                        embedding,
                    ])
                    .map_err(|e| QaError::database(format!("Failed to insert passage: {}", e)))?;
                }
            }

            tx.commit().map_err(|e| QaError::database(e.to_string()))?;

            debug!("Inserted {} passages", passages.len());
            Ok(())
        })
        .await
    }

    async fn get_passage(&self, id: &str) -> Result<Option<Passage>> {
        let id = id.to_string();
        self.with_conn("passage lookup", move |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM passages WHERE id = ?1", PASSAGE_COLUMNS))
                .map_err(|e| QaError::database(e.to_string()))?;

            let result = stmt
                .query_row(params![id], |row| Self::row_to_passage(row))
                .optional()
                .map_err(|e| QaError::database(e.to_string()))?;

            Ok(result)
        })
        .await
    }

    async fn get_passages(&self, ids: &[String]) -> Result<Vec<Passage>> {
        let ids = ids.to_vec();
        self.with_conn("passage lookup", move |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM passages WHERE id = ?1", PASSAGE_COLUMNS))
                .map_err(|e| QaError::store_unavailable("passage lookup", e.to_string()))?;

            let mut passages = Vec::with_capacity(ids.len());
            for id in &ids {
                let passage = stmt
                    .query_row(params![id], |row| Self::row_to_passage(row))
                    .optional()
                    .map_err(|e| QaError::store_unavailable("passage lookup", e.to_string()))?;
                if let Some(p) = passage {
                    passages.push(p);
                }
            }

            Ok(passages)
        })
        .await
    }

    async fn search_lexical(
        &self,
        tokens: &[String],
        fields: &[LexicalField],
        k: usize,
    ) -> Result<Vec<ScoredCandidate>> {
        if tokens.is_empty() || fields.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let match_expr = Self::fts5_match_expression(tokens, fields);

        self.with_conn("lexical search", move |conn| {
            let mut stmt = conn
                .prepare(
                    r#"
                    SELECT p.id, bm25(passages_fts) AS score
                    FROM passages_fts f
                    JOIN passages p ON p.rowid = f.rowid
                    WHERE passages_fts MATCH ?1
                    ORDER BY score, p.id
                    LIMIT ?2
                    "#,
                )
                .map_err(|e| QaError::store_unavailable("lexical search", e.to_string()))?;

            let rows = stmt
                .query_map(params![match_expr, k as i64], |row| {
                    let id: String = row.get(0)?;
                    let score: f64 = row.get(1)?;
                    // FTS5 bm25() is negative, lower is better.
                    Ok(ScoredCandidate::lexical(id, (-score) as f32))
                })
                .map_err(|e| QaError::store_unavailable("lexical search", e.to_string()))?;

            let results: Vec<_> = rows
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| QaError::store_unavailable("lexical search", e.to_string()))?;

            debug!("Lexical search matched {} passages", results.len());
            Ok(results)
        })
        .await
    }

    async fn search_dense(&self, embedding: &[f32], k: usize) -> Result<Vec<ScoredCandidate>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedding = embedding.to_vec();
        self.with_conn("dense search", move |conn| {
            let mut stmt = conn
                .prepare("SELECT id, embedding FROM passages WHERE embedding IS NOT NULL")
                .map_err(|e| QaError::store_unavailable("dense search", e.to_string()))?;

            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let bytes: Vec<u8> = row.get(1)?;
                    Ok((id, bytes))
                })
                .map_err(|e| QaError::store_unavailable("dense search", e.to_string()))?;

            let mut scored = Vec::new();
            for row in rows {
                let (id, bytes) =
                    row.map_err(|e| QaError::store_unavailable("dense search", e.to_string()))?;
                let stored = bytes_to_vec(&bytes);
                if stored.len() != embedding.len() {
                    return Err(QaError::invalid_argument(format!(
                        "query embedding has dimension {}, passage {} has {}",
                        embedding.len(),
                        id,
                        stored.len()
                    )));
                }
                scored.push((id, cosine_similarity(&embedding, &stored)));
            }

            Ok(top_k(scored, k, ScoreOrigin::Dense))
        })
        .await
    }

    async fn stats(&self) -> Result<Stats> {
        self.with_conn("stats", |conn| {
            let passages: u64 = conn
                .query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))
                .map_err(|e| QaError::database(e.to_string()))?;

            let embeddings: u64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM passages WHERE embedding IS NOT NULL",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| QaError::database(e.to_string()))?;

            let laws: u64 = conn
                .query_row("SELECT COUNT(DISTINCT law) FROM passages", [], |row| row.get(0))
                .map_err(|e| QaError::database(e.to_string()))?;

            // Get page count and page size to estimate storage
            let page_count: u64 = conn
                .query_row("PRAGMA page_count", [], |row| row.get(0))
                .unwrap_or(0);
            let page_size: u64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .unwrap_or(4096);

            Ok(Stats {
                passages,
                embeddings,
                laws,
                storage_bytes: page_count * page_size,
            })
        })
        .await
    }
}

// Helper methods
impl SqliteStore {
    /// Convert a row to a Passage.
    fn row_to_passage(row: &rusqlite::Row<'_>) -> rusqlite::Result<Passage> {
        let embedding: Option<Vec<u8>> = row.get(12)?;

        Ok(Passage {
            id: row.get(0)?,
            law: row.get(1)?,
            chapter: row.get(2)?,
            section: row.get(3)?,
            article_no: row.get(4)?,
            article_title: row.get(5)?,
            clause_no: row.get(6)?,
            point: row.get(7)?,
            clause_head: row.get(8)?,
            text: row.get(9)?,
            enriched_text: row.get(10)?,
            citation: row.get(11)?,
            embedding: embedding.map(|b| bytes_to_vec(&b)).unwrap_or_default(),
        })
    }

    /// Build an FTS5 query that ORs the quoted tokens within the given columns.
    fn fts5_match_expression(tokens: &[String], fields: &[LexicalField]) -> String {
        let mut seen = std::collections::HashSet::new();
        let terms: Vec<String> = tokens
            .iter()
            .filter(|t| seen.insert(t.as_str()))
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect();

        let columns: Vec<&str> = fields.iter().map(|f| f.column()).collect();

        format!("{{{}}} : ({})", columns.join(" "), terms.join(" OR "))
    }
}
