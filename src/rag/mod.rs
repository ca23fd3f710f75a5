pub mod answer;
pub mod embeddings;
pub mod vector_store;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Chunk, RetrievedChunk};

use self::embeddings::EmbeddingGenerator;
use self::vector_store::VectorStore;

const EMBED_BATCH_SIZE: usize = 32;

/// The similarity index consumed by both orchestrators. Distance scores are
/// raw metric distances; converting them to similarities is the caller's
/// concern.
#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Embed and index the chunks, creating the index on first use.
    /// Durable once this returns.
    async fn insert(&self, chunks: &[Chunk]) -> Result<usize>;

    /// Up to `k` nearest chunks with ascending distance. Empty when the
    /// index has never been created.
    async fn search_with_scores(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(RetrievedChunk, f32)>>;

    /// Total indexed vectors; 0 when uninitialized.
    async fn total_vector_count(&self) -> Result<u64>;
}

pub struct SimilarityIndex {
    embeddings: Arc<EmbeddingGenerator>,
    store: VectorStore,
}

impl SimilarityIndex {
    pub fn new(embeddings: Arc<EmbeddingGenerator>, store: VectorStore) -> Self {
        Self { embeddings, store }
    }
}

#[async_trait]
impl ChunkIndex for SimilarityIndex {
    async fn insert(&self, chunks: &[Chunk]) -> Result<usize> {
        for batch in chunks.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embeddings_batch = self.embeddings.generate(texts)?;
            self.store.add_chunks(batch, embeddings_batch).await?;
        }

        Ok(chunks.len())
    }

    async fn search_with_scores(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<(RetrievedChunk, f32)>> {
        let query_embedding = self.embeddings.generate_single(query)?;
        self.store.search(query_embedding, k as u64).await
    }

    async fn total_vector_count(&self) -> Result<u64> {
        self.store.point_count().await
    }
}
