use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// One ingested guideline. Records are insert-only: re-ingestion is prevented
/// by the pipeline's existence check, not by a uniqueness constraint.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GuidelineRecord {
    pub id: Uuid,
    pub gene: String,
    pub drug: String,
    pub title: String,
    pub pdf_path: String,
    pub chunks_count: i32,
    pub element_count: i32,
    pub elements: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait GuidelineStore: Send + Sync {
    /// Case-insensitive lookup; when duplicates exist the most recently
    /// created record wins.
    async fn find(&self, gene: &str, drug: &str) -> Result<Option<GuidelineRecord>>;

    /// Insert a new record and return its guideline id
    /// (`"{gene}_{drug}_{uuid}"`).
    async fn store(
        &self,
        gene: &str,
        drug: &str,
        title: &str,
        pdf_path: &str,
        chunks_count: i32,
        elements: &serde_json::Value,
    ) -> Result<String>;

    async fn count(&self) -> Result<i64>;
}

pub struct PgGuidelineStore {
    pool: PgPool,
}

impl PgGuidelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS guidelines (
                id UUID PRIMARY KEY,
                gene TEXT NOT NULL,
                drug TEXT NOT NULL,
                title TEXT NOT NULL,
                pdf_path TEXT NOT NULL,
                chunks_count INT NOT NULL,
                element_count INT NOT NULL,
                elements JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_guidelines_pair
                ON guidelines(LOWER(gene), LOWER(drug), created_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl GuidelineStore for PgGuidelineStore {
    async fn find(&self, gene: &str, drug: &str) -> Result<Option<GuidelineRecord>> {
        let record = sqlx::query_as::<_, GuidelineRecord>(
            r#"
            SELECT * FROM guidelines
            WHERE LOWER(gene) = LOWER($1) AND LOWER(drug) = LOWER($2)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(gene)
        .bind(drug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn store(
        &self,
        gene: &str,
        drug: &str,
        title: &str,
        pdf_path: &str,
        chunks_count: i32,
        elements: &serde_json::Value,
    ) -> Result<String> {
        let id = Uuid::new_v4();
        let element_count = elements.as_array().map(|a| a.len()).unwrap_or(0) as i32;

        sqlx::query(
            r#"
            INSERT INTO guidelines
                (id, gene, drug, title, pdf_path, chunks_count, element_count, elements, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(id)
        .bind(gene)
        .bind(drug)
        .bind(title)
        .bind(pdf_path)
        .bind(chunks_count)
        .bind(element_count)
        .bind(elements)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let guideline_id = format!("{}_{}_{}", gene, drug, id);
        tracing::info!("Stored guideline {} ({} chunks)", guideline_id, chunks_count);
        Ok(guideline_id)
    }

    async fn count(&self) -> Result<i64> {
        let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM guidelines")
            .fetch_one(&self.pool)
            .await?;
        Ok(total.0)
    }
}
