use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use quorum_schema::{DocumentRecord, RelationRecord, VectorRecord};

use crate::migrations::run_memory_migrations;

/// Initialize sqlite-vec extension. Must be called before Connection::open().
fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

/// Ranked hit from one of the three stores.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: Uuid,
    pub text: String,
    pub score: f64,
}

/// Vector / document / relational stores over a single sqlite database.
/// The embedding dimension is fixed at open time; inserts with another
/// dimension are rejected before any write.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Mutex<Connection>>,
    dimensions: usize,
}

impl MemoryStore {
    pub fn open(path: &str, dimensions: usize) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_memory_migrations(&conn)?;
        let store = Self {
            db: Arc::new(Mutex::new(conn)),
            dimensions,
        };
        store.ensure_vec_table()?;
        Ok(store)
    }

    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_memory_migrations(&conn)?;
        let store = Self {
            db: Arc::new(Mutex::new(conn)),
            dimensions,
        };
        store.ensure_vec_table()?;
        Ok(store)
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Create (or recreate, on dimension change) the vec0 KNN table.
    /// Failure is tolerated: search falls back to in-process cosine over
    /// the JSON embeddings column.
    fn ensure_vec_table(&self) -> Result<()> {
        let dimensions = self.dimensions;
        let db = self
            .db
            .lock()
            .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

        let current_dims: Option<String> = db
            .query_row(
                "SELECT value FROM meta WHERE key = 'vec_dimensions'",
                [],
                |r| r.get(0),
            )
            .optional()?;

        let needs_recreate = match current_dims {
            Some(d) => d.parse::<usize>().unwrap_or(0) != dimensions,
            None => true,
        };

        if needs_recreate {
            db.execute_batch("DROP TABLE IF EXISTS vector_index;")?;
            let created = db.execute_batch(&format!(
                "CREATE VIRTUAL TABLE vector_index USING vec0(record_id TEXT PRIMARY KEY, embedding float[{dimensions}] distance_metric=cosine);"
            ));
            match created {
                Ok(()) => {
                    db.execute(
                        "INSERT INTO meta(key, value) VALUES('vec_dimensions', ?1) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![dimensions.to_string()],
                    )?;
                }
                Err(e) => {
                    tracing::warn!("vec0 table unavailable, using cosine fallback: {e}");
                }
            }
        }

        Ok(())
    }

    // ============================================================
    // Vector store
    // ============================================================

    pub async fn insert_vector(&self, record: VectorRecord) -> Result<()> {
        if record.embedding.len() != self.dimensions {
            return Err(anyhow!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                record.embedding.len()
            ));
        }

        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let tags = serde_json::to_string(&record.tags)?;
            let embedding = embedding_to_json(&record.embedding);
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                r#"
                INSERT INTO vector_records (id, text, embedding, tags, importance, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    record.id.to_string(),
                    record.text,
                    embedding,
                    tags,
                    record.importance,
                    record.created_at.to_rfc3339(),
                ],
            )?;
            if has_vec_table(&tx)? {
                tx.execute(
                    "INSERT OR REPLACE INTO vector_index(record_id, embedding) VALUES (?1, ?2)",
                    params![record.id.to_string(), embedding],
                )?;
            }
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// Top-k by cosine similarity, with an optional tag filter. Uses the
    /// vec0 index when present, otherwise scans the JSON embeddings.
    pub async fn search_vectors(
        &self,
        query_embedding: &[f32],
        k: usize,
        tag_filter: Option<BTreeSet<String>>,
    ) -> Result<Vec<RankedHit>> {
        if query_embedding.len() != self.dimensions {
            return Err(anyhow!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimensions,
                query_embedding.len()
            ));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        // Over-fetch so a post-query tag filter still fills k results.
        let candidate_limit = if tag_filter.is_some() { k * 4 } else { k };
        let query_embedding = query_embedding.to_vec();
        let db = Arc::clone(&self.db);

        let candidates: Vec<(String, String, String, f64)> = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            if has_vec_table(&conn)? {
                let query_json = embedding_to_json(&query_embedding);
                let mut stmt = conn.prepare(
                    r#"
                    SELECT v.record_id, r.text, r.tags, v.distance
                    FROM vector_index v
                    JOIN vector_records r ON r.id = v.record_id
                    WHERE v.embedding MATCH ?1 AND k = ?2
                    "#,
                )?;
                let rows = stmt.query_map(params![query_json, candidate_limit as i64], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, f64>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, text, tags, distance) = row?;
                    out.push((id, text, tags, (1.0_f64 - distance).max(0.0)));
                }
                out.sort_by(|a, b| b.3.total_cmp(&a.3));
                return Ok::<_, anyhow::Error>(out);
            }

            let mut stmt =
                conn.prepare("SELECT id, text, tags, embedding FROM vector_records")?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, text, tags, embedding_json) = row?;
                let embedding = json_to_embedding(&embedding_json)?;
                let score = cosine_similarity(&query_embedding, &embedding) as f64;
                out.push((id, text, tags, score));
            }
            out.sort_by(|a, b| b.3.total_cmp(&a.3));
            out.truncate(candidate_limit);
            Ok::<_, anyhow::Error>(out)
        })
        .await??;

        let mut hits = Vec::new();
        for (id, text, tags_json, score) in candidates {
            if let Some(ref wanted) = tag_filter {
                let tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();
                if wanted.intersection(&tags).next().is_none() {
                    continue;
                }
            }
            hits.push(RankedHit {
                id: Uuid::parse_str(&id)?,
                text,
                score,
            });
            if hits.len() >= k {
                break;
            }
        }
        Ok(hits)
    }

    // ============================================================
    // Document store
    // ============================================================

    pub async fn insert_document(&self, record: DocumentRecord) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let metadata = serde_json::to_string(&record.metadata)?;
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO documents (id, text, metadata) VALUES (?1, ?2, ?3)",
                params![record.id.to_string(), record.text, metadata],
            )?;
            tx.execute(
                "INSERT INTO documents_fts (text, id) VALUES (?1, ?2)",
                params![record.text, record.id.to_string()],
            )?;
            tx.commit()?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// bm25-ranked full-text match; falls back to a case-insensitive
    /// substring scan when the query is not valid FTS syntax.
    pub async fn search_documents(&self, query: &str, k: usize) -> Result<Vec<RankedHit>> {
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let db = Arc::clone(&self.db);
        let query_owned = query.to_owned();
        let fts_hits = task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, text, bm25(documents_fts) AS rank
                FROM documents_fts
                WHERE documents_fts MATCH ?1
                ORDER BY rank
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![query_owned, k as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, text, rank) = row?;
                let score = 1.0_f64 / (1.0_f64 + (-rank).max(0.0_f64));
                out.push((id, text, score));
            }
            Ok::<Vec<(String, String, f64)>, anyhow::Error>(out)
        })
        .await?;

        let rows = match fts_hits {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!("fts match failed, falling back to substring scan: {e}");
                let db = Arc::clone(&self.db);
                let needle = query.to_lowercase();
                task::spawn_blocking(move || {
                    let conn = db
                        .lock()
                        .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
                    let mut stmt = conn.prepare(
                        "SELECT id, text FROM documents WHERE instr(lower(text), ?1) > 0 LIMIT ?2",
                    )?;
                    let rows = stmt.query_map(params![needle, k as i64], |r| {
                        Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                    })?;
                    let mut out = Vec::new();
                    for row in rows {
                        let (id, text) = row?;
                        out.push((id, text, 0.5));
                    }
                    Ok::<Vec<(String, String, f64)>, anyhow::Error>(out)
                })
                .await??
            }
        };

        rows.into_iter()
            .map(|(id, text, score)| {
                Ok(RankedHit {
                    id: Uuid::parse_str(&id)?,
                    text,
                    score,
                })
            })
            .collect()
    }

    // ============================================================
    // Relational store
    // ============================================================

    pub async fn insert_relation(&self, record: RelationRecord) -> Result<()> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            conn.execute(
                r#"
                INSERT INTO relations (id, subject, predicate, object, confidence)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    record.id.to_string(),
                    record.subject,
                    record.predicate,
                    record.object,
                    record.confidence,
                ],
            )?;
            Ok::<(), anyhow::Error>(())
        })
        .await??;

        Ok(())
    }

    /// Pattern match over subject/predicate/object, ranked by confidence.
    pub async fn search_relations(&self, pattern: &str, k: usize) -> Result<Vec<RankedHit>> {
        let db = Arc::clone(&self.db);
        let like = format!("%{}%", pattern.to_lowercase());
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let mut stmt = conn.prepare(
                r#"
                SELECT id, subject, predicate, object, confidence
                FROM relations
                WHERE lower(subject) LIKE ?1 OR lower(predicate) LIKE ?1 OR lower(object) LIKE ?1
                ORDER BY confidence DESC
                LIMIT ?2
                "#,
            )?;
            let rows = stmt.query_map(params![like, k as i64], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, f64>(4)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (id, subject, predicate, object, confidence) = row?;
                out.push(RankedHit {
                    id: parse_uuid_sql(&id)?,
                    text: format!("{subject} {predicate} {object}"),
                    score: confidence,
                });
            }
            Ok::<Vec<RankedHit>, anyhow::Error>(out)
        })
        .await?
    }

    // ============================================================
    // Clear / counts / snapshot
    // ============================================================

    /// Remove vector records whose text contains any of the patterns
    /// (case-insensitive). Empty pattern list removes everything.
    pub async fn clear_vectors(&self, patterns: &[String]) -> Result<usize> {
        self.clear_table("vector_records", Some("vector_index"), patterns)
            .await
    }

    pub async fn clear_documents(&self, patterns: &[String]) -> Result<usize> {
        self.clear_table("documents", Some("documents_fts"), patterns)
            .await
    }

    pub async fn clear_relations(&self, patterns: &[String]) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            if patterns.is_empty() {
                let n = conn.execute("DELETE FROM relations", [])?;
                return Ok::<usize, anyhow::Error>(n);
            }
            let mut total = 0;
            for p in &patterns {
                let like = format!("%{p}%");
                total += conn.execute(
                    "DELETE FROM relations WHERE lower(subject) LIKE ?1 OR lower(predicate) LIKE ?1 OR lower(object) LIKE ?1",
                    params![like],
                )?;
            }
            Ok::<usize, anyhow::Error>(total)
        })
        .await?
    }

    async fn clear_table(
        &self,
        table: &'static str,
        shadow: Option<&'static str>,
        patterns: &[String],
    ) -> Result<usize> {
        let db = Arc::clone(&self.db);
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_lowercase()).collect();
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let tx = conn.unchecked_transaction()?;

            let ids: Vec<String> = if patterns.is_empty() {
                let mut stmt = tx.prepare(&format!("SELECT id FROM {table}"))?;
                let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            } else {
                let mut collected = BTreeSet::new();
                for p in &patterns {
                    let mut stmt = tx.prepare(&format!(
                        "SELECT id FROM {table} WHERE instr(lower(text), ?1) > 0"
                    ))?;
                    let rows = stmt.query_map(params![p], |r| r.get::<_, String>(0))?;
                    for row in rows {
                        collected.insert(row?);
                    }
                }
                collected.into_iter().collect()
            };

            for id in &ids {
                tx.execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
                if let Some(shadow_table) = shadow {
                    if shadow_table == "vector_index" {
                        if has_vec_table(&tx)? {
                            tx.execute(
                                "DELETE FROM vector_index WHERE record_id = ?1",
                                params![id],
                            )?;
                        }
                    } else {
                        tx.execute(
                            &format!("DELETE FROM {shadow_table} WHERE id = ?1"),
                            params![id],
                        )?;
                    }
                }
            }

            tx.commit()?;
            Ok::<usize, anyhow::Error>(ids.len())
        })
        .await?
    }

    /// Record counts per store (vector, document, relational).
    pub async fn counts(&self) -> Result<(usize, usize, usize)> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;
            let vectors: i64 =
                conn.query_row("SELECT COUNT(*) FROM vector_records", [], |r| r.get(0))?;
            let documents: i64 =
                conn.query_row("SELECT COUNT(*) FROM documents", [], |r| r.get(0))?;
            let relations: i64 =
                conn.query_row("SELECT COUNT(*) FROM relations", [], |r| r.get(0))?;
            Ok::<(usize, usize, usize), anyhow::Error>((
                vectors as usize,
                documents as usize,
                relations as usize,
            ))
        })
        .await?
    }

    pub async fn export_records(
        &self,
    ) -> Result<(Vec<VectorRecord>, Vec<DocumentRecord>, Vec<RelationRecord>)> {
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db
                .lock()
                .map_err(|_| anyhow!("failed to lock sqlite connection"))?;

            let mut stmt = conn.prepare(
                "SELECT id, text, embedding, tags, importance, created_at FROM vector_records",
            )?;
            let vectors = stmt
                .query_map([], row_to_vector)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt = conn.prepare("SELECT id, text, metadata FROM documents")?;
            let documents = stmt
                .query_map([], row_to_document)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stmt =
                conn.prepare("SELECT id, subject, predicate, object, confidence FROM relations")?;
            let relations = stmt
                .query_map([], row_to_relation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok::<_, anyhow::Error>((vectors, documents, relations))
        })
        .await?
    }

    pub async fn import_records(
        &self,
        vectors: Vec<VectorRecord>,
        documents: Vec<DocumentRecord>,
        relations: Vec<RelationRecord>,
    ) -> Result<()> {
        for record in vectors {
            self.insert_vector(record).await?;
        }
        for record in documents {
            self.insert_document(record).await?;
        }
        for record in relations {
            self.insert_relation(record).await?;
        }
        Ok(())
    }
}

fn has_vec_table(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='vector_index'",
        [],
        |r| r.get(0),
    )
}

pub(crate) fn embedding_to_json(embedding: &[f32]) -> String {
    serde_json::to_string(embedding).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn json_to_embedding(raw: &str) -> Result<Vec<f32>> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn parse_datetime_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_uuid_sql(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_vector(row: &Row<'_>) -> rusqlite::Result<VectorRecord> {
    let id_raw: String = row.get(0)?;
    let embedding_raw: String = row.get(2)?;
    let tags_raw: String = row.get(3)?;
    let created_raw: String = row.get(5)?;
    Ok(VectorRecord {
        id: parse_uuid_sql(&id_raw)?,
        text: row.get(1)?,
        embedding: serde_json::from_str(&embedding_raw).unwrap_or_default(),
        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
        importance: row.get(4)?,
        created_at: parse_datetime_sql(&created_raw)?,
    })
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let id_raw: String = row.get(0)?;
    let metadata_raw: String = row.get(2)?;
    Ok(DocumentRecord {
        id: parse_uuid_sql(&id_raw)?,
        text: row.get(1)?,
        metadata: serde_json::from_str(&metadata_raw).unwrap_or_default(),
    })
}

fn row_to_relation(row: &Row<'_>) -> rusqlite::Result<RelationRecord> {
    let id_raw: String = row.get(0)?;
    Ok(RelationRecord {
        id: parse_uuid_sql(&id_raw)?,
        subject: row.get(1)?,
        predicate: row.get(2)?,
        object: row.get(3)?,
        confidence: row.get(4)?,
    })
}
