//! Chunk-embed-retrieve pipeline over per-judge document collections.

use atelier_kernel::error::{EngineError, EngineResult};
use atelier_kernel::judge::{DocumentChunk, JudgeAgent};
use atelier_kernel::llm::{DynLlmProvider, EmbeddingRequest};
use tracing::debug;
use uuid::Uuid;

use super::chunker::TextChunker;
use super::similarity::cosine_similarity;

/// Chunks embedded per backend call.
pub const EMBED_BATCH_SIZE: usize = 10;

/// A chunk surfaced by retrieval, highest similarity first.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub document_id: Uuid,
    pub chunk_index: usize,
    pub content: String,
    pub score: f32,
}

/// Result of a retrieval, with the embedding tokens it spent.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub chunks: Vec<RetrievedChunk>,
    pub embedding_tokens: u64,
}

/// Result of indexing one document.
#[derive(Debug, Clone)]
pub struct IndexedDocument {
    pub chunks: Vec<DocumentChunk>,
    pub embedding_tokens: u64,
}

/// Embedding-backed retrieval over judge documents.
pub struct RagIndex {
    provider: DynLlmProvider,
    embedding_model: String,
    chunker: TextChunker,
}

impl RagIndex {
    pub fn new(provider: DynLlmProvider, embedding_model: impl Into<String>) -> Self {
        Self {
            provider,
            embedding_model: embedding_model.into(),
            chunker: TextChunker::with_defaults(),
        }
    }

    /// Chunk and embed a document's text. The caller persists the returned
    /// chunks under the owning document.
    pub async fn index_document(&self, text: &str) -> EngineResult<IndexedDocument> {
        let pieces = self.chunker.chunk(text);
        if pieces.is_empty() {
            return Ok(IndexedDocument {
                chunks: vec![],
                embedding_tokens: 0,
            });
        }

        let mut chunks: Vec<DocumentChunk> = Vec::with_capacity(pieces.len());
        let mut embedding_tokens = 0u64;

        for (batch_index, batch) in pieces.chunks(EMBED_BATCH_SIZE).enumerate() {
            let base = batch_index * EMBED_BATCH_SIZE;
            let request =
                EmbeddingRequest::batch(self.embedding_model.clone(), batch.to_vec());
            let response = self.provider.embedding(request).await?;
            if response.data.len() != batch.len() {
                return Err(EngineError::Backend(format!(
                    "embedding batch returned {} vectors for {} inputs",
                    response.data.len(),
                    batch.len()
                )));
            }
            embedding_tokens += response.total_tokens();

            for data in response.data {
                let position = base + data.index as usize;
                chunks.push(DocumentChunk {
                    id: Uuid::new_v4(),
                    chunk_index: position,
                    content: pieces[position].clone(),
                    embedding: data.embedding,
                });
            }
        }

        chunks.sort_by_key(|c| c.chunk_index);

        // All chunks of one index share the embedding dimension.
        if let Some(first) = chunks.first() {
            let dim = first.embedding.len();
            if chunks.iter().any(|c| c.embedding.len() != dim) {
                return Err(EngineError::Backend(
                    "embedding backend returned mixed dimensions".into(),
                ));
            }
        }

        Ok(IndexedDocument {
            chunks,
            embedding_tokens,
        })
    }

    /// Top-K cosine retrieval over a judge's documents.
    ///
    /// Embeds the query once, scores every stored chunk, filters by the
    /// judge's similarity threshold and returns the best `top_k`. A judge
    /// without documents costs nothing.
    pub async fn retrieve(&self, agent: &JudgeAgent, query: &str) -> EngineResult<Retrieval> {
        let total_chunks: usize = agent.documents.iter().map(|d| d.chunks.len()).sum();
        if total_chunks == 0 || query.trim().is_empty() {
            return Ok(Retrieval::default());
        }

        let request = EmbeddingRequest::single(self.embedding_model.clone(), query);
        let response = self.provider.embedding(request).await?;
        let embedding_tokens = response.total_tokens();
        let query_embedding = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EngineError::Backend("embedding backend returned no vector".into()))?;

        let mut scored: Vec<RetrievedChunk> = Vec::new();
        for document in &agent.documents {
            for chunk in &document.chunks {
                let score = cosine_similarity(&query_embedding, &chunk.embedding)?;
                if score >= agent.rag.similarity_threshold {
                    scored.push(RetrievedChunk {
                        document_id: document.id,
                        chunk_index: chunk.chunk_index,
                        content: chunk.content.clone(),
                        score,
                    });
                }
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let top_k = agent.rag.top_k.clamp(1, 20);
        scored.truncate(top_k);

        debug!(
            agent = %agent.name,
            retrieved = scored.len(),
            scanned = total_chunks,
            "rag retrieval"
        );

        Ok(Retrieval {
            chunks: scored,
            embedding_tokens,
        })
    }
}
