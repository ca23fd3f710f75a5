use std::path::Path;

use anyhow::Result;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

/// Dimensionality of the all-MiniLM-L6-v2 embeddings.
pub const EMBEDDING_DIM: u64 = 384;

/// Wrapper around the fastembed MiniLM model. Constructed once at startup
/// and shared behind an `Arc`; re-creating it per call is far too expensive.
pub struct EmbeddingGenerator {
    model: TextEmbedding,
}

impl EmbeddingGenerator {
    pub fn new(cache_dir: &Path) -> Result<Self> {
        tracing::info!("Initializing embedding model (all-MiniLM-L6-v2)...");

        let model = TextEmbedding::try_new(InitOptions {
            model_name: EmbeddingModel::AllMiniLML6V2,
            cache_dir: cache_dir.to_path_buf(),
            show_download_progress: false,
            ..Default::default()
        })
        .map_err(|e| anyhow::anyhow!("Failed to initialize embedding model: {}", e))?;

        tracing::info!("Embedding model initialized successfully");
        Ok(Self { model })
    }

    pub fn generate(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let embeddings = self.model.embed(texts, None)?;
        Ok(embeddings)
    }

    pub fn generate_single(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.generate(vec![text.to_string()])?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Embedding model returned no vectors"))
    }
}
