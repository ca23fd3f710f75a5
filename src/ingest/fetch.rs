use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use calamine::{open_workbook, Reader, Xlsx};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use thiserror::Error;

use crate::config::Settings;
use crate::models::GeneDrugPair;

const USER_AGENT: &str = "Mozilla/5.0 (CPIC-RAG-Bot)";

static HREF_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).unwrap()
});

/// Failures while locating and downloading a guideline PDF. These model
/// expected real-world absence and map to a clean `failed` ingestion
/// outcome, never a server error.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("gene-drug pair ({gene}/{drug}) not found in the CPIC database")]
    PairNotFound { gene: String, drug: String },
    #[error("no PDF link found on {0}")]
    NoPdfLink(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Produce a local file path to the guideline PDF for this pair, or fail.
    async fn fetch_guideline(&self, gene: &str, drug: &str) -> Result<PathBuf, FetchError>;
}

/// The CPIC gene-drug reference spreadsheet (Gene / Drug / Guideline columns).
pub struct CpicDataset {
    rows: Vec<PairRow>,
}

#[derive(Debug, Clone)]
struct PairRow {
    gene: String,
    drug: String,
    guideline_url: String,
}

impl CpicDataset {
    pub fn load(path: &Path) -> Result<Self> {
        let mut workbook: Xlsx<_> = open_workbook(path)
            .with_context(|| format!("Failed to open CPIC pairs file: {}", path.display()))?;

        let sheet_names = workbook.sheet_names().to_vec();
        let first_sheet = sheet_names
            .first()
            .ok_or_else(|| anyhow::anyhow!("CPIC pairs file has no sheets"))?;
        let range = workbook
            .worksheet_range(first_sheet)
            .with_context(|| format!("Failed to read sheet '{}'", first_sheet))?;

        let mut rows_iter = range.rows();
        let header = rows_iter
            .next()
            .ok_or_else(|| anyhow::anyhow!("CPIC pairs file is empty"))?;

        let column = |name: &str| {
            header
                .iter()
                .position(|cell| cell.to_string().trim() == name)
                .ok_or_else(|| anyhow::anyhow!("CPIC pairs file is missing a '{}' column", name))
        };
        let gene_col = column("Gene")?;
        let drug_col = column("Drug")?;
        let guideline_col = column("Guideline")?;

        let mut rows = Vec::new();
        for row in rows_iter {
            let cell = |idx: usize| {
                row.get(idx)
                    .map(|c| c.to_string().trim().to_string())
                    .unwrap_or_default()
            };
            let gene = cell(gene_col);
            let drug = cell(drug_col);
            if gene.is_empty() || drug.is_empty() {
                continue;
            }
            rows.push(PairRow {
                gene,
                drug,
                guideline_url: cell(guideline_col),
            });
        }

        Ok(Self { rows })
    }

    /// Case-insensitive lookup of a pair's guideline page URL.
    pub fn locate(&self, gene: &str, drug: &str) -> Option<&str> {
        self.rows
            .iter()
            .find(|row| {
                row.gene.eq_ignore_ascii_case(gene) && row.drug.eq_ignore_ascii_case(drug)
            })
            .map(|row| row.guideline_url.as_str())
            .filter(|url| !url.is_empty())
    }

    pub fn genes(&self) -> Vec<String> {
        let mut genes: Vec<String> = self.rows.iter().map(|r| r.gene.clone()).collect();
        genes.sort();
        genes.dedup();
        genes
    }

    pub fn drugs(&self) -> Vec<String> {
        let mut drugs: Vec<String> = self.rows.iter().map(|r| r.drug.clone()).collect();
        drugs.sort();
        drugs.dedup();
        drugs
    }

    pub fn pairs(&self) -> Vec<GeneDrugPair> {
        self.rows
            .iter()
            .map(|r| GeneDrugPair {
                gene: r.gene.clone(),
                drug: r.drug.clone(),
            })
            .collect()
    }
}

/// Find the first PDF-looking link on a guideline page, resolved absolute
/// against the page URL.
pub fn find_pdf_link(page_url: &str, html: &str) -> Result<String, FetchError> {
    for cap in HREF_PATTERN.captures_iter(html) {
        let href = &cap[1];
        if href.to_lowercase().contains(".pdf") {
            let absolute = Url::parse(page_url)
                .and_then(|base| base.join(href))
                .with_context(|| format!("Invalid PDF link '{}' on {}", href, page_url))?;
            return Ok(absolute.to_string());
        }
    }
    Err(FetchError::NoPdfLink(page_url.to_string()))
}

/// Locate-and-fetch pipeline against the live CPIC site: spreadsheet lookup,
/// guideline page scrape, PDF download.
pub struct CpicGuidelineFetcher {
    client: Client,
    dataset_path: PathBuf,
    pdf_dir: PathBuf,
}

impl CpicGuidelineFetcher {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            dataset_path: settings.cpic_pairs_path.clone(),
            pdf_dir: settings.pdf_dir.clone(),
        })
    }

    async fn fetch_page(&self, page_url: &str) -> Result<String> {
        let response = self
            .client
            .get(page_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to fetch guideline page {}", page_url))?;
        Ok(response.text().await?)
    }

    async fn download_pdf(&self, pdf_url: &str, gene: &str, drug: &str) -> Result<PathBuf> {
        let response = self
            .client
            .get(pdf_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("Failed to download PDF {}", pdf_url))?;
        let bytes = response.bytes().await?;

        tokio::fs::create_dir_all(&self.pdf_dir).await?;
        let path = self.pdf_dir.join(format!("{}_{}_Guideline.pdf", gene, drug));
        tokio::fs::write(&path, &bytes).await?;

        tracing::info!("Downloaded PDF to {}", path.display());
        Ok(path)
    }
}

#[async_trait]
impl SourceFetcher for CpicGuidelineFetcher {
    async fn fetch_guideline(&self, gene: &str, drug: &str) -> Result<PathBuf, FetchError> {
        let dataset = CpicDataset::load(&self.dataset_path)?;
        let page_url = dataset
            .locate(gene, drug)
            .ok_or_else(|| FetchError::PairNotFound {
                gene: gene.to_string(),
                drug: drug.to_string(),
            })?
            .to_string();
        tracing::info!("Found guideline page for {}/{}: {}", gene, drug, page_url);

        let html = self.fetch_page(&page_url).await?;
        let pdf_url = find_pdf_link(&page_url, &html)?;
        tracing::info!("Found PDF link: {}", pdf_url);

        let path = self.download_pdf(&pdf_url, gene, drug).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> CpicDataset {
        CpicDataset {
            rows: vec![
                PairRow {
                    gene: "CYP2D6".to_string(),
                    drug: "codeine".to_string(),
                    guideline_url: "https://cpicpgx.org/guidelines/codeine/".to_string(),
                },
                PairRow {
                    gene: "CYP2C19".to_string(),
                    drug: "clopidogrel".to_string(),
                    guideline_url: "https://cpicpgx.org/guidelines/clopidogrel/".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_locate_is_case_insensitive() {
        let ds = dataset();
        assert_eq!(
            ds.locate("cyp2d6", "CODEINE"),
            Some("https://cpicpgx.org/guidelines/codeine/")
        );
    }

    #[test]
    fn test_locate_unknown_pair_is_none() {
        assert!(dataset().locate("XXX", "Nonexistent").is_none());
    }

    #[test]
    fn test_genes_are_sorted_and_unique() {
        let mut ds = dataset();
        ds.rows.push(PairRow {
            gene: "CYP2D6".to_string(),
            drug: "tramadol".to_string(),
            guideline_url: String::new(),
        });
        assert_eq!(ds.genes(), vec!["CYP2C19", "CYP2D6"]);
    }

    #[test]
    fn test_find_pdf_link_resolves_relative_href() {
        let html = r#"<a href="/wp-content/guideline.PDF">Download</a>"#;
        let url = find_pdf_link("https://cpicpgx.org/guidelines/codeine/", html).unwrap();
        assert_eq!(url, "https://cpicpgx.org/wp-content/guideline.PDF");
    }

    #[test]
    fn test_find_pdf_link_skips_non_pdf_anchors() {
        let html = concat!(
            r#"<a href='/about'>About</a>"#,
            r#"<a href="files/CYP2D6.pdf?download=1">PDF</a>"#,
        );
        let url = find_pdf_link("https://cpicpgx.org/guidelines/codeine/", html).unwrap();
        assert_eq!(
            url,
            "https://cpicpgx.org/guidelines/codeine/files/CYP2D6.pdf?download=1"
        );
    }

    #[test]
    fn test_find_pdf_link_without_pdf_is_error() {
        let err = find_pdf_link("https://cpicpgx.org/", "<a href='/about'>x</a>").unwrap_err();
        assert!(matches!(err, FetchError::NoPdfLink(_)));
        assert!(err.to_string().contains("no PDF link found"));
    }

    #[test]
    fn test_pair_not_found_message_names_the_cpic_database() {
        let err = FetchError::PairNotFound {
            gene: "XXX".to_string(),
            drug: "Nonexistent".to_string(),
        };
        assert!(err.to_string().contains("not found in the CPIC database"));
    }
}
