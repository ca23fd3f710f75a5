use anyhow::Result;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder, UpsertPointsBuilder,
    VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::models::{Chunk, RetrievedChunk};

use super::embeddings::EMBEDDING_DIM;

/// Qdrant-backed chunk storage. The collection is created lazily on the
/// first insert; search and count treat a missing collection as an empty
/// index rather than an error.
pub struct VectorStore {
    client: Qdrant,
    collection_name: String,
}

impl VectorStore {
    pub fn connect(url: &str, collection_name: &str) -> Result<Self> {
        tracing::info!("Building Qdrant client for URL: {}", url);
        let client = match Qdrant::from_url(url).build() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Qdrant client build failed: {:?}", e);
                anyhow::bail!("Qdrant client build failed: {}", e);
            }
        };

        Ok(Self {
            client,
            collection_name: collection_name.to_string(),
        })
    }

    async fn collection_exists(&self) -> Result<bool> {
        Ok(self.client.collection_exists(&self.collection_name).await?)
    }

    async fn ensure_collection(&self) -> Result<()> {
        if !self.collection_exists().await? {
            tracing::info!("Creating Qdrant collection '{}'", self.collection_name);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name)
                        .vectors_config(VectorParamsBuilder::new(EMBEDDING_DIM, Distance::Euclid)),
                )
                .await?;
        }
        Ok(())
    }

    /// Upsert a batch of embedded chunks. Returns once the server has
    /// acknowledged the write.
    pub async fn add_chunks(&self, chunks: &[Chunk], embeddings: Vec<Vec<f32>>) -> Result<()> {
        self.ensure_collection().await?;

        let points: Vec<PointStruct> = chunks
            .iter()
            .zip(embeddings.into_iter())
            .map(|(chunk, embedding)| {
                let mut payload = JsonMap::new();
                payload.insert("text".to_string(), JsonValue::String(chunk.text.clone()));
                payload.insert("title".to_string(), JsonValue::String(chunk.title.clone()));
                payload.insert("page".to_string(), JsonValue::from(chunk.page));
                payload.insert("gene".to_string(), JsonValue::String(chunk.gene.clone()));
                payload.insert("drug".to_string(), JsonValue::String(chunk.drug.clone()));
                payload.insert(
                    "element_type".to_string(),
                    JsonValue::String(chunk.element_type.clone()),
                );
                payload.insert("source".to_string(), JsonValue::String(chunk.source.clone()));

                PointStruct::new(Uuid::new_v4().to_string(), embedding, payload)
            })
            .collect();

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points))
            .await?;

        Ok(())
    }

    /// K-nearest-neighbor search. The returned score is the raw Euclidean
    /// distance, ascending (closest first).
    pub async fn search(
        &self,
        query_vector: Vec<f32>,
        limit: u64,
    ) -> Result<Vec<(RetrievedChunk, f32)>> {
        if !self.collection_exists().await? {
            return Ok(Vec::new());
        }

        let search_result = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection_name, query_vector, limit)
                    .with_payload(true),
            )
            .await?;

        let mut results = Vec::new();
        for point in search_result.result {
            let payload = point.payload;
            let text = payload
                .get("text")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default();
            let title = payload
                .get("title")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .unwrap_or_default();
            let page = payload
                .get("page")
                .and_then(|v| v.as_integer())
                .map(|p| p.max(0) as u32)
                .unwrap_or(0);
            let element_type = payload
                .get("element_type")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string());

            results.push((
                RetrievedChunk {
                    text,
                    title,
                    page,
                    element_type,
                },
                point.score,
            ));
        }

        Ok(results)
    }

    pub async fn point_count(&self) -> Result<u64> {
        if !self.collection_exists().await? {
            return Ok(0);
        }

        let info = self.client.collection_info(&self.collection_name).await?;
        Ok(info.result.and_then(|r| r.points_count).unwrap_or(0))
    }
}
