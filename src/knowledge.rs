//! Knowledge index over code chunks and the summarising query engine
//!
//! The semantic mode embeds chunks locally with FastEmbed (AllMiniLML6V2) through
//! rig's `InMemoryVectorStore`; the lexical mode ranks chunks by identifier-set
//! Jaccard similarity and needs neither a model download nor a network.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use rig::{
    embeddings::{Embedding, EmbeddingsBuilder},
    vector_store::{
        in_memory_store::{InMemoryVectorIndex, InMemoryVectorStore},
        request::VectorSearchRequest,
        VectorStoreIndex,
    },
    OneOrMany,
};
use rig_fastembed::{EmbeddingModel, FastembedModel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::ingest::CodeChunk;
use crate::llm::LanguageModel;

pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    Semantic,
    Lexical,
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrievalMode::Semantic => write!(f, "semantic"),
            RetrievalMode::Lexical => write!(f, "lexical"),
        }
    }
}

impl FromStr for RetrievalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "semantic" | "embedding" | "vector" => Ok(RetrievalMode::Semantic),
            "lexical" | "keyword" => Ok(RetrievalMode::Lexical),
            other => Err(format!("unknown retrieval mode: {other}")),
        }
    }
}

/// A chunk returned from a search, best first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub score: f64,
    pub chunk: CodeChunk,
}

#[async_trait]
pub trait Retriever: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedChunk>>;
}

// ============================================================================
// Index
// ============================================================================

enum Backend {
    /// Built once per index and shared by every search
    Semantic(InMemoryVectorIndex<EmbeddingModel, CodeChunk>),
    Lexical,
}

/// Searchable index over the chunks of one repository
pub struct KnowledgeIndex {
    mode: RetrievalMode,
    chunks: Vec<CodeChunk>,
    /// Embedding vectors per chunk, aligned with `chunks` (empty in lexical mode)
    vectors: Vec<Vec<Vec<f64>>>,
    backend: Backend,
}

impl KnowledgeIndex {
    pub fn mode(&self) -> RetrievalMode {
        self.mode
    }

    pub fn chunks(&self) -> &[CodeChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn lexical_search(&self, query: &str, limit: usize) -> Vec<RetrievedChunk> {
        let query_terms = terms(query);
        let mut scored: Vec<RetrievedChunk> = self
            .chunks
            .iter()
            .map(|chunk| RetrievedChunk {
                score: jaccard(&query_terms, &terms(&chunk.content)),
                chunk: chunk.clone(),
            })
            .filter(|r| r.score > 0.0)
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }
}

#[async_trait]
impl Retriever for KnowledgeIndex {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<RetrievedChunk>> {
        debug!("🔍 Searching index ({}) for '{}' (limit {})", self.mode, query, limit);
        if self.chunks.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        match &self.backend {
            Backend::Lexical => Ok(self.lexical_search(query, limit)),
            Backend::Semantic(index) => {
                let req = VectorSearchRequest::builder()
                    .query(query)
                    .samples(limit as u64)
                    .build()?;

                let results = index
                    .top_n::<CodeChunk>(req)
                    .await?
                    .into_iter()
                    .map(|(score, _id, chunk)| RetrievedChunk { score, chunk })
                    .collect();
                Ok(results)
            }
        }
    }
}

/// Identifier-ish tokens, lowercased
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

// ============================================================================
// Builder and persistence
// ============================================================================

#[derive(Serialize, Deserialize)]
struct StoredIndex {
    mode: RetrievalMode,
    entries: Vec<StoredEntry>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    chunk: CodeChunk,
    #[serde(default)]
    embeddings: Vec<Vec<f64>>,
}

/// Builds, saves and loads [`KnowledgeIndex`]es
pub struct KnowledgeBuilder {
    mode: RetrievalMode,
}

impl KnowledgeBuilder {
    pub fn new(mode: RetrievalMode) -> Self {
        Self { mode }
    }

    fn embedding_model() -> EmbeddingModel {
        debug!("Creating FastEmbed model AllMiniLML6V2");
        rig_fastembed::Client::new().embedding_model(&FastembedModel::AllMiniLML6V2)
    }

    /// Build a fresh index over `chunks`
    pub async fn build(&self, chunks: Vec<CodeChunk>) -> Result<KnowledgeIndex> {
        info!("🧠 Building {} knowledge index over {} chunks", self.mode, chunks.len());

        match self.mode {
            RetrievalMode::Lexical => Ok(KnowledgeIndex {
                mode: self.mode,
                chunks,
                vectors: Vec::new(),
                backend: Backend::Lexical,
            }),
            RetrievalMode::Semantic => {
                let model = Self::embedding_model();
                if chunks.is_empty() {
                    return Ok(KnowledgeIndex {
                        mode: self.mode,
                        chunks,
                        vectors: Vec::new(),
                        backend: Backend::Semantic(InMemoryVectorStore::default().index(model)),
                    });
                }

                let embeddings = EmbeddingsBuilder::new(model.clone())
                    .documents(chunks)?
                    .build()
                    .await
                    .context("Failed to embed code chunks")?;

                let mut ordered = Vec::with_capacity(embeddings.len());
                let mut vectors = Vec::with_capacity(embeddings.len());
                for (chunk, embedding) in &embeddings {
                    ordered.push(chunk.clone());
                    vectors.push(embedding.iter().map(|e| e.vec.clone()).collect());
                }

                let store = InMemoryVectorStore::from_documents_with_id_f(embeddings, |c| c.id.clone());
                info!("✅ Embedded {} chunks", ordered.len());

                Ok(KnowledgeIndex {
                    mode: self.mode,
                    chunks: ordered,
                    vectors,
                    backend: Backend::Semantic(store.index(model)),
                })
            }
        }
    }

    /// Persist `index` to `<dir>/index.json`
    pub fn save(&self, index: &KnowledgeIndex, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create index directory {}", dir.display()))?;

        let entries = index
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| StoredEntry {
                chunk: chunk.clone(),
                embeddings: index.vectors.get(i).cloned().unwrap_or_default(),
            })
            .collect();
        let stored = StoredIndex {
            mode: index.mode,
            entries,
        };

        let path = dir.join(INDEX_FILE);
        fs::write(&path, serde_json::to_vec(&stored)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("💾 Saved knowledge index to {}", path.display());
        Ok(())
    }

    /// Whether `dir` holds a saved index
    pub fn exists(dir: &Path) -> bool {
        dir.join(INDEX_FILE).is_file()
    }

    /// Reload an index saved with [`KnowledgeBuilder::save`]; no re-embedding happens
    pub fn load(&self, dir: &Path) -> Result<KnowledgeIndex> {
        let path = dir.join(INDEX_FILE);
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let stored: StoredIndex = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt knowledge index at {}", path.display()))?;
        info!(
            "📂 Loaded {} index with {} chunks from {}",
            stored.mode,
            stored.entries.len(),
            path.display()
        );

        match stored.mode {
            RetrievalMode::Lexical => Ok(KnowledgeIndex {
                mode: stored.mode,
                chunks: stored.entries.into_iter().map(|e| e.chunk).collect(),
                vectors: Vec::new(),
                backend: Backend::Lexical,
            }),
            RetrievalMode::Semantic => {
                let mut documents = Vec::with_capacity(stored.entries.len());
                let mut chunks = Vec::with_capacity(stored.entries.len());
                let mut vectors = Vec::with_capacity(stored.entries.len());
                for entry in stored.entries {
                    if entry.embeddings.is_empty() {
                        bail!("Chunk {} has no stored embedding", entry.chunk.id);
                    }
                    let embeddings: Vec<Embedding> = entry
                        .embeddings
                        .iter()
                        .map(|vec| Embedding {
                            document: entry.chunk.content.clone(),
                            vec: vec.clone(),
                        })
                        .collect();
                    let embeddings = OneOrMany::many(embeddings)
                        .map_err(|e| anyhow!("Invalid embeddings for {}: {e}", entry.chunk.id))?;

                    chunks.push(entry.chunk.clone());
                    vectors.push(entry.embeddings);
                    documents.push((entry.chunk, embeddings));
                }

                let store = InMemoryVectorStore::from_documents_with_id_f(documents, |c| c.id.clone());
                Ok(KnowledgeIndex {
                    mode: stored.mode,
                    chunks,
                    vectors,
                    backend: Backend::Semantic(store.index(Self::embedding_model())),
                })
            }
        }
    }
}

// ============================================================================
// Query engine
// ============================================================================

/// Retrieves the top-k chunks for a question and has the model answer from them
#[derive(Clone)]
pub struct QueryEngine {
    retriever: Arc<dyn Retriever>,
    model: Arc<dyn LanguageModel>,
    top_k: usize,
}

impl QueryEngine {
    pub fn new(retriever: Arc<dyn Retriever>, model: Arc<dyn LanguageModel>, top_k: usize) -> Self {
        Self {
            retriever,
            model,
            top_k: top_k.max(1),
        }
    }

    pub async fn retrieve(&self, question: &str) -> Result<Vec<RetrievedChunk>> {
        self.retriever.search(question, self.top_k).await
    }

    pub async fn query(&self, question: &str) -> Result<String> {
        let hits = self.retrieve(question).await?;
        if hits.is_empty() {
            debug!("No indexed code matched '{}'", question);
            return Ok(format!("No relevant code found in the index for: {question}"));
        }

        let context = hits
            .iter()
            .map(|hit| {
                format!(
                    "File: {} (lines {}-{})\n{}",
                    hit.chunk.file_path, hit.chunk.start_line, hit.chunk.end_line, hit.chunk.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Context information from the codebase is below.\n\
             ---------------------\n\
             {context}\n\
             ---------------------\n\
             Given the context information and not prior knowledge, answer the query.\n\
             Query: {question}\n\
             Answer: "
        );
        self.model.complete(&prompt).await
    }
}
