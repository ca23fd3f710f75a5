use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Settings;
use crate::models::PhenotypeResponse;

const MAX_RETRIES: u32 = 3;
const USER_AGENT: &str = "CPIC-RAG-Bot/1.0";

/// One diplotype row as served by the CPIC REST API (and cached locally).
/// `totalactivityscore` stays a string; parsing it is best-effort on read.
#[derive(Debug, Clone, Deserialize, sqlx::FromRow)]
pub struct DiplotypeRow {
    #[serde(default)]
    pub genesymbol: String,
    #[serde(default)]
    pub diplotype: String,
    #[serde(default)]
    pub generesult: Option<String>,
    #[serde(default)]
    pub totalactivityscore: Option<String>,
    #[serde(default)]
    pub consultationtext: Option<String>,
    #[serde(default)]
    pub ehrpriority: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[async_trait]
pub trait PhenotypeAuthority: Send + Sync {
    /// All diplotype rows for a gene.
    async fn fetch_diplotypes(&self, gene: &str) -> Result<Vec<DiplotypeRow>>;

    /// Every gene symbol the authority knows about.
    async fn list_genes(&self) -> Result<Vec<String>>;
}

#[async_trait]
pub trait DiplotypeCache: Send + Sync {
    async fn rows_for(&self, gene: &str) -> Result<Vec<DiplotypeRow>>;

    /// Replace every cached row for the gene in one transaction, so rows
    /// from a previous fetch never linger alongside fresh ones.
    async fn replace_gene(&self, gene: &str, rows: &[DiplotypeRow]) -> Result<()>;

    async fn genes(&self) -> Result<Vec<String>>;
}

/// CPIC REST API client with bounded retry on server-side errors.
pub struct CpicApiClient {
    client: Client,
    base_url: String,
}

impl CpicApiClient {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.cpic_api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn get_with_retry(&self, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let url = format!("{}/diplotype", self.base_url);
        let mut attempt = 0u32;

        loop {
            let response = self.client.get(&url).query(query).send().await?;
            if response.status().is_server_error() && attempt + 1 < MAX_RETRIES {
                attempt += 1;
                let backoff = Duration::from_secs(1 << attempt);
                tracing::warn!(
                    "CPIC API returned {}, retrying in {:?} (attempt {}/{})",
                    response.status(),
                    backoff,
                    attempt,
                    MAX_RETRIES
                );
                tokio::time::sleep(backoff).await;
                continue;
            }
            return Ok(response.error_for_status()?);
        }
    }
}

#[async_trait]
impl PhenotypeAuthority for CpicApiClient {
    async fn fetch_diplotypes(&self, gene: &str) -> Result<Vec<DiplotypeRow>> {
        let genesymbol = format!("eq.{}", gene);
        let response = self
            .get_with_retry(&[("genesymbol", genesymbol.as_str())])
            .await?;
        let rows: Vec<DiplotypeRow> = response.json().await?;
        tracing::info!("Fetched {} diplotype entries for {} from CPIC API", rows.len(), gene);
        Ok(rows)
    }

    async fn list_genes(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct GeneRow {
            #[serde(default)]
            genesymbol: String,
        }

        let response = self
            .get_with_retry(&[("select", "genesymbol"), ("limit", "1000")])
            .await?;
        let rows: Vec<GeneRow> = response.json().await?;

        let mut genes: Vec<String> = rows
            .into_iter()
            .map(|r| r.genesymbol)
            .filter(|g| !g.is_empty())
            .collect();
        genes.sort();
        genes.dedup();
        Ok(genes)
    }
}

pub struct PgDiplotypeCache {
    pool: PgPool,
}

impl PgDiplotypeCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS diplotype_cache (
                id UUID PRIMARY KEY,
                genesymbol TEXT NOT NULL,
                diplotype TEXT NOT NULL,
                generesult TEXT,
                totalactivityscore TEXT,
                consultationtext TEXT,
                ehrpriority TEXT,
                description TEXT,
                cached_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_diplotype_cache_gene
                ON diplotype_cache(LOWER(genesymbol))
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl DiplotypeCache for PgDiplotypeCache {
    async fn rows_for(&self, gene: &str) -> Result<Vec<DiplotypeRow>> {
        let rows = sqlx::query_as::<_, DiplotypeRow>(
            r#"
            SELECT genesymbol, diplotype, generesult, totalactivityscore,
                   consultationtext, ehrpriority, description
            FROM diplotype_cache
            WHERE LOWER(genesymbol) = LOWER($1)
            "#,
        )
        .bind(gene)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn replace_gene(&self, gene: &str, rows: &[DiplotypeRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM diplotype_cache WHERE LOWER(genesymbol) = LOWER($1)")
            .bind(gene)
            .execute(&mut *tx)
            .await?;

        let cached_at = Utc::now();
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO diplotype_cache
                    (id, genesymbol, diplotype, generesult, totalactivityscore,
                     consultationtext, ehrpriority, description, cached_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&row.genesymbol)
            .bind(&row.diplotype)
            .bind(&row.generesult)
            .bind(&row.totalactivityscore)
            .bind(&row.consultationtext)
            .bind(&row.ehrpriority)
            .bind(&row.description)
            .bind(cached_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::info!("Cached {} diplotype entries for {}", rows.len(), gene);
        Ok(())
    }

    async fn genes(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT genesymbol FROM diplotype_cache ORDER BY genesymbol")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

fn parse_activity_score(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
}

/// Diplotype-to-phenotype resolution: cache first, authority on a miss,
/// stale cache when the authority is unreachable.
pub struct PhenotypeResolver {
    cache: Arc<dyn DiplotypeCache>,
    authority: Arc<dyn PhenotypeAuthority>,
}

impl PhenotypeResolver {
    pub fn new(cache: Arc<dyn DiplotypeCache>, authority: Arc<dyn PhenotypeAuthority>) -> Self {
        Self { cache, authority }
    }

    async fn diplotype_rows(&self, gene: &str) -> Result<Vec<DiplotypeRow>> {
        let cached = self.cache.rows_for(gene).await?;
        if !cached.is_empty() {
            return Ok(cached);
        }

        match self.authority.fetch_diplotypes(gene).await {
            Ok(rows) => {
                if !rows.is_empty() {
                    if let Err(e) = self.cache.replace_gene(gene, &rows).await {
                        tracing::warn!("Failed to cache diplotypes for {}: {}", gene, e);
                    }
                }
                Ok(rows)
            }
            Err(e) => {
                tracing::warn!("CPIC API error for {}: {}. Trying stale cache...", gene, e);
                Ok(self.cache.rows_for(gene).await.unwrap_or_default())
            }
        }
    }

    pub async fn lookup(&self, gene: &str, diplotype: &str) -> Result<PhenotypeResponse> {
        let rows = self.diplotype_rows(gene).await?;

        if rows.is_empty() {
            return Ok(PhenotypeResponse {
                gene: gene.to_string(),
                diplotype: diplotype.to_string(),
                phenotype: "Gene not found in CPIC database".to_string(),
                activity_score: None,
                recommendation: format!("No diplotype data available for {}.", gene),
                ehr_priority: String::new(),
                description: String::new(),
            });
        }

        let wanted = diplotype.trim().to_lowercase();
        let matched = rows
            .iter()
            .find(|row| row.diplotype.trim().to_lowercase() == wanted);

        let Some(row) = matched else {
            return Ok(PhenotypeResponse {
                gene: gene.to_string(),
                diplotype: diplotype.to_string(),
                phenotype: "Diplotype not found".to_string(),
                activity_score: None,
                recommendation: format!(
                    "No phenotype mapping found for {} {} in CPIC.",
                    gene, diplotype
                ),
                ehr_priority: String::new(),
                description: String::new(),
            });
        };

        Ok(PhenotypeResponse {
            gene: gene.to_string(),
            diplotype: diplotype.to_string(),
            phenotype: row
                .generesult
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            activity_score: parse_activity_score(row.totalactivityscore.as_deref()),
            recommendation: row.consultationtext.clone().unwrap_or_default(),
            ehr_priority: row.ehrpriority.clone().unwrap_or_default(),
            description: row.description.clone().unwrap_or_default(),
        })
    }

    pub async fn available_genes(&self) -> Result<Vec<String>> {
        match self.authority.list_genes().await {
            Ok(genes) => Ok(genes),
            Err(e) => {
                tracing::warn!("CPIC API error fetching genes: {}. Using cache...", e);
                self.cache.genes().await
            }
        }
    }

    pub async fn diplotypes_for_gene(&self, gene: &str) -> Result<Vec<String>> {
        let rows = self.diplotype_rows(gene).await?;
        let mut diplotypes: Vec<String> = rows
            .into_iter()
            .map(|r| r.diplotype)
            .filter(|d| !d.is_empty())
            .collect();
        diplotypes.sort();
        diplotypes.dedup();
        Ok(diplotypes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct MemoryCache {
        rows: Mutex<Vec<DiplotypeRow>>,
    }

    impl MemoryCache {
        fn new(rows: Vec<DiplotypeRow>) -> Self {
            Self {
                rows: Mutex::new(rows),
            }
        }
    }

    #[async_trait]
    impl DiplotypeCache for MemoryCache {
        async fn rows_for(&self, gene: &str) -> Result<Vec<DiplotypeRow>> {
            Ok(self
                .rows
                .lock()
                .await
                .iter()
                .filter(|r| r.genesymbol.eq_ignore_ascii_case(gene))
                .cloned()
                .collect())
        }

        async fn replace_gene(&self, gene: &str, rows: &[DiplotypeRow]) -> Result<()> {
            let mut cached = self.rows.lock().await;
            cached.retain(|r| !r.genesymbol.eq_ignore_ascii_case(gene));
            cached.extend_from_slice(rows);
            Ok(())
        }

        async fn genes(&self) -> Result<Vec<String>> {
            let mut genes: Vec<String> = self
                .rows
                .lock()
                .await
                .iter()
                .map(|r| r.genesymbol.clone())
                .collect();
            genes.sort();
            genes.dedup();
            Ok(genes)
        }
    }

    struct StubAuthority {
        rows: Vec<DiplotypeRow>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StubAuthority {
        fn returning(rows: Vec<DiplotypeRow>) -> Self {
            Self {
                rows,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                rows: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PhenotypeAuthority for StubAuthority {
        async fn fetch_diplotypes(&self, _gene: &str) -> Result<Vec<DiplotypeRow>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(self.rows.clone())
        }

        async fn list_genes(&self) -> Result<Vec<String>> {
            if self.fail {
                anyhow::bail!("connection refused");
            }
            Ok(self
                .rows
                .iter()
                .map(|r| r.genesymbol.clone())
                .collect())
        }
    }

    fn row(gene: &str, diplotype: &str, score: Option<&str>) -> DiplotypeRow {
        DiplotypeRow {
            genesymbol: gene.to_string(),
            diplotype: diplotype.to_string(),
            generesult: Some("Normal Metabolizer".to_string()),
            totalactivityscore: score.map(|s| s.to_string()),
            consultationtext: Some("Initiate standard therapy.".to_string()),
            ehrpriority: Some("Normal/Routine/Low Risk".to_string()),
            description: Some("Two normal function alleles".to_string()),
        }
    }

    #[test]
    fn test_activity_score_parses_numeric_strings() {
        assert_eq!(parse_activity_score(Some("2")), Some(2.0));
        assert_eq!(parse_activity_score(Some(" 1.5 ")), Some(1.5));
    }

    #[test]
    fn test_activity_score_absent_for_malformed_values() {
        assert_eq!(parse_activity_score(Some("N/A")), None);
        assert_eq!(parse_activity_score(Some("")), None);
        assert_eq!(parse_activity_score(None), None);
    }

    #[tokio::test]
    async fn test_lookup_takes_fields_from_matching_row() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::returning(vec![row(
                "CYP2C19",
                "*1/*1",
                Some("2"),
            )])),
        );

        let result = resolver.lookup("CYP2C19", "*1/*1").await.unwrap();
        assert_eq!(result.phenotype, "Normal Metabolizer");
        assert_eq!(result.activity_score, Some(2.0));
        assert_eq!(result.recommendation, "Initiate standard therapy.");
    }

    #[tokio::test]
    async fn test_lookup_match_ignores_case_and_whitespace() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::returning(vec![row(
                "CYP2D6",
                "*1/*4",
                Some("1"),
            )])),
        );

        let result = resolver.lookup("CYP2D6", " *1/*4 ").await.unwrap();
        assert_eq!(result.phenotype, "Normal Metabolizer");
    }

    #[tokio::test]
    async fn test_lookup_malformed_activity_score_is_absent() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::returning(vec![row(
                "CYP2C19",
                "*1/*2",
                Some("N/A"),
            )])),
        );

        let result = resolver.lookup("CYP2C19", "*1/*2").await.unwrap();
        assert_eq!(result.activity_score, None);
        assert_eq!(result.phenotype, "Normal Metabolizer");
    }

    #[tokio::test]
    async fn test_lookup_unknown_diplotype_is_a_distinct_outcome() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::returning(vec![row(
                "CYP2C19",
                "*1/*1",
                Some("2"),
            )])),
        );

        let result = resolver.lookup("CYP2C19", "*9/*9").await.unwrap();
        assert_eq!(result.phenotype, "Diplotype not found");
        assert_eq!(result.activity_score, None);
    }

    #[tokio::test]
    async fn test_lookup_unknown_gene_is_a_distinct_outcome() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::returning(Vec::new())),
        );

        let result = resolver.lookup("FAKE1", "*1/*1").await.unwrap();
        assert_eq!(result.phenotype, "Gene not found in CPIC database");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_the_authority() {
        let authority = Arc::new(StubAuthority::returning(Vec::new()));
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(vec![row("CYP2D6", "*1/*1", Some("2"))])),
            authority.clone(),
        );

        let result = resolver.lookup("CYP2D6", "*1/*1").await.unwrap();
        assert_eq!(result.phenotype, "Normal Metabolizer");
        assert_eq!(authority.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_falls_back_to_stale_cache() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::failing()),
        );

        // No cache either: resolves to the gene-not-found outcome, not an error.
        let result = resolver.lookup("CYP2D6", "*1/*1").await.unwrap();
        assert_eq!(result.phenotype, "Gene not found in CPIC database");
    }

    #[tokio::test]
    async fn test_successful_fetch_populates_the_gene_cache() {
        let cache = Arc::new(MemoryCache::new(Vec::new()));
        let authority = Arc::new(StubAuthority::returning(vec![row(
            "CYP2D6",
            "*1/*1",
            Some("2"),
        )]));

        let resolver = PhenotypeResolver::new(cache.clone(), authority.clone());
        resolver.lookup("CYP2D6", "*1/*1").await.unwrap();
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);

        let cached = cache.rows_for("CYP2D6").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].diplotype, "*1/*1");

        // Second lookup is served from the cache.
        resolver.lookup("CYP2D6", "*1/*1").await.unwrap();
        assert_eq!(authority.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_diplotypes_for_gene_are_sorted_unique() {
        let resolver = PhenotypeResolver::new(
            Arc::new(MemoryCache::new(Vec::new())),
            Arc::new(StubAuthority::returning(vec![
                row("CYP2C19", "*2/*2", None),
                row("CYP2C19", "*1/*1", None),
                row("CYP2C19", "*1/*1", None),
            ])),
        );

        let diplotypes = resolver.diplotypes_for_gene("CYP2C19").await.unwrap();
        assert_eq!(diplotypes, vec!["*1/*1", "*2/*2"]);
    }
}
