use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quorum_schema::{
    DocumentRecord, MemoryHit, MemoryKind, MemoryRecord, Message, Session, VectorRecord,
};

use crate::embedding::EmbeddingProvider;
use crate::session_store::SessionStore;
use crate::store::MemoryStore;

pub const SNAPSHOT_VERSION: u32 = 1;

/// Round-trippable snapshot of everything the engine persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub sessions: Vec<SessionExport>,
    pub vector_records: Vec<VectorRecord>,
    pub documents: Vec<DocumentRecord>,
    pub relations: Vec<quorum_schema::RelationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionExport {
    pub session: Session,
    pub messages: Vec<Message>,
}

/// Outcome of a clear/filter operation, per store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClearOutcome {
    pub vectors: usize,
    pub documents: usize,
    pub relations: usize,
    pub messages: usize,
}

/// Current record counts, reported on the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySizes {
    pub vectors: usize,
    pub documents: usize,
    pub relations: usize,
    pub sessions: usize,
}

/// Unified facade over the three memory stores and the session log.
/// Agents read through `search`; the orchestrator writes back through
/// `remember` after each answered request.
#[derive(Clone)]
pub struct MemoryLayer {
    store: Arc<MemoryStore>,
    sessions: Arc<SessionStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl MemoryLayer {
    pub fn new(
        store: Arc<MemoryStore>,
        sessions: Arc<SessionStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            sessions,
            embedder,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Write one record to the store its kind selects. Vector records with
    /// an empty embedding are embedded here first.
    pub async fn store(&self, record: MemoryRecord) -> Result<()> {
        match record {
            MemoryRecord::Vector(mut record) => {
                if record.embedding.is_empty() {
                    let embedded = self.embedder.embed(&[record.text.clone()]).await?;
                    record.embedding = embedded.into_iter().next().unwrap_or_default();
                }
                self.store.insert_vector(record).await
            }
            MemoryRecord::Document(record) => self.store.insert_document(record).await,
            MemoryRecord::Relational(record) => self.store.insert_relation(record).await,
        }
    }

    /// Convenience write-back: embed `text` and store it as a vector record.
    pub async fn remember(
        &self,
        text: impl Into<String>,
        tags: BTreeSet<String>,
        importance: f32,
    ) -> Result<Uuid> {
        let text = text.into();
        let embedded = self.embedder.embed(&[text.clone()]).await?;
        let record = VectorRecord {
            id: Uuid::new_v4(),
            text,
            embedding: embedded.into_iter().next().unwrap_or_default(),
            tags,
            importance,
            created_at: Utc::now(),
        };
        let id = record.id;
        self.store.insert_vector(record).await?;
        Ok(id)
    }

    /// Ranked search against one store. Vector queries are embedded here.
    pub async fn search(
        &self,
        query: &str,
        kind: MemoryKind,
        k: usize,
        tag_filter: Option<BTreeSet<String>>,
    ) -> Result<Vec<MemoryHit>> {
        let hits = match kind {
            MemoryKind::Vector => {
                let embedded = self.embedder.embed(&[query.to_owned()]).await?;
                let query_embedding = embedded
                    .into_iter()
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("embedder returned no query embedding"))?;
                self.store
                    .search_vectors(&query_embedding, k, tag_filter)
                    .await?
            }
            MemoryKind::Document => self.store.search_documents(query, k).await?,
            MemoryKind::Relational => self.store.search_relations(query, k).await?,
        };

        Ok(hits
            .into_iter()
            .map(|hit| MemoryHit {
                text: hit.text,
                score: hit.score,
                kind,
            })
            .collect())
    }

    /// Merged best hits across all three stores, highest score first. Used
    /// for agent prompt assembly; a failure in any store degrades to the
    /// hits from the others.
    pub async fn search_all(&self, query: &str, k: usize) -> Vec<MemoryHit> {
        let mut hits = Vec::new();
        for kind in [
            MemoryKind::Vector,
            MemoryKind::Document,
            MemoryKind::Relational,
        ] {
            match self.search(query, kind, k, None).await {
                Ok(mut found) => hits.append(&mut found),
                Err(e) => tracing::warn!("memory search ({kind:?}) failed, degrading: {e}"),
            }
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        hits
    }

    pub async fn recent_conversation(&self, session_id: &str, n: usize) -> Result<Vec<Message>> {
        self.sessions.recent(session_id, n).await
    }

    /// Clear records. With patterns, removes matching records from the
    /// selected stores plus matching session messages (case-insensitive
    /// substring); without, wipes the selected stores.
    pub async fn clear(
        &self,
        kind: Option<MemoryKind>,
        patterns: &[String],
    ) -> Result<ClearOutcome> {
        let mut outcome = ClearOutcome::default();
        match kind {
            Some(MemoryKind::Vector) => {
                outcome.vectors = self.store.clear_vectors(patterns).await?;
            }
            Some(MemoryKind::Document) => {
                outcome.documents = self.store.clear_documents(patterns).await?;
            }
            Some(MemoryKind::Relational) => {
                outcome.relations = self.store.clear_relations(patterns).await?;
            }
            None => {
                outcome.vectors = self.store.clear_vectors(patterns).await?;
                outcome.documents = self.store.clear_documents(patterns).await?;
                outcome.relations = self.store.clear_relations(patterns).await?;
            }
        }
        if !patterns.is_empty() {
            outcome.messages = self.sessions.delete_messages_matching(patterns).await?;
        }
        Ok(outcome)
    }

    pub async fn sizes(&self) -> Result<MemorySizes> {
        let (vectors, documents, relations) = self.store.counts().await?;
        let sessions = self.sessions.session_count().await?;
        Ok(MemorySizes {
            vectors,
            documents,
            relations,
            sessions,
        })
    }

    pub async fn export(&self) -> Result<Snapshot> {
        let (vector_records, documents, relations) = self.store.export_records().await?;
        let sessions = self
            .sessions
            .export_sessions()
            .await?
            .into_iter()
            .map(|(session, messages)| SessionExport { session, messages })
            .collect();
        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            sessions,
            vector_records,
            documents,
            relations,
        })
    }

    pub async fn import(&self, snapshot: Snapshot) -> Result<()> {
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!("unsupported snapshot version: {}", snapshot.version);
        }
        self.store
            .import_records(
                snapshot.vector_records,
                snapshot.documents,
                snapshot.relations,
            )
            .await?;
        self.sessions
            .import_sessions(
                snapshot
                    .sessions
                    .into_iter()
                    .map(|s| (s.session, s.messages))
                    .collect(),
            )
            .await
    }
}
