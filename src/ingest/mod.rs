pub mod extractor;
pub mod fetch;
pub mod parser;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::models::{IngestResponse, IngestStatus};
use crate::rag::ChunkIndex;
use crate::store::GuidelineStore;

use self::extractor::extract_chunks;
use self::fetch::SourceFetcher;
use self::parser::DocumentParser;

fn completed(message: String, guideline_id: Option<String>) -> IngestResponse {
    IngestResponse {
        status: IngestStatus::Completed,
        message,
        guideline_id,
    }
}

fn failed(message: String) -> IngestResponse {
    IngestResponse {
        status: IngestStatus::Failed,
        message,
        guideline_id: None,
    }
}

/// Runs the full guideline ingestion pipeline for one gene/drug pair:
/// existence check, PDF locate-or-fetch, parse, chunk extraction, record
/// store, vector insert.
///
/// Missing pairs, pages without a PDF, and parser rejections are expected
/// absence and come back as a `failed` response; store and index write
/// failures are infrastructure faults and propagate as errors.
pub struct IngestionPipeline {
    store: Arc<dyn GuidelineStore>,
    index: Arc<dyn ChunkIndex>,
    fetcher: Arc<dyn SourceFetcher>,
    parser: Arc<dyn DocumentParser>,
    pdf_dir: PathBuf,
    // Serializes ingestions of the same pair so the existence check and the
    // store write cannot interleave across requests.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn GuidelineStore>,
        index: Arc<dyn ChunkIndex>,
        fetcher: Arc<dyn SourceFetcher>,
        parser: Arc<dyn DocumentParser>,
        pdf_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            index,
            fetcher,
            parser,
            pdf_dir,
            locks: DashMap::new(),
        }
    }

    pub async fn ingest(&self, gene: &str, drug: &str) -> Result<IngestResponse> {
        let key = format!("{}/{}", gene.to_lowercase(), drug.to_lowercase());
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Already ingested: report the existing record, do no further work.
        if let Some(existing) = self.store.find(gene, drug).await? {
            tracing::info!("Guideline for {}/{} already ingested", gene, drug);
            return Ok(completed(
                format!(
                    "Guideline for {}/{} is already ingested ({} chunks).",
                    gene, drug, existing.chunks_count
                ),
                Some(format!("{}_{}_{}", gene, drug, existing.id)),
            ));
        }

        // Locate the source PDF: local store first, then the live pipeline.
        let pdf_path = match self.find_existing_pdf(drug) {
            Some(path) => {
                tracing::info!("Using existing PDF {}", path.display());
                path
            }
            None => {
                tracing::info!("No existing PDF for {}. Fetching from CPIC...", drug);
                match self.fetcher.fetch_guideline(gene, drug).await {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("Guideline fetch failed for {}/{}: {}", gene, drug, e);
                        return Ok(failed(format!(
                            "Could not find or fetch a guideline PDF for '{}/{}': {}.",
                            gene, drug, e
                        )));
                    }
                }
            }
        };

        let pdf_name = pdf_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| pdf_path.display().to_string());

        // Parse into structured elements.
        let elements = match self.parser.parse(&pdf_path).await {
            Ok(elements) => elements,
            Err(e) => {
                tracing::warn!("Parsing failed for {}: {}", pdf_name, e);
                return Ok(failed(format!(
                    "Document parser failed on '{}': {}.",
                    pdf_name, e
                )));
            }
        };
        if elements.is_empty() {
            return Ok(failed(format!(
                "Document parser returned no elements for '{}'.",
                pdf_name
            )));
        }

        let chunks = extract_chunks(&elements, gene, drug);
        if chunks.is_empty() {
            return Ok(failed(format!(
                "No meaningful text extracted from '{}'.",
                pdf_name
            )));
        }

        // Persist the record, then index the chunks. Failures from here on
        // are infrastructure faults and must not be swallowed.
        let title = pdf_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| pdf_name.clone());
        let elements_json = serde_json::to_value(&elements)?;
        let guideline_id = self
            .store
            .store(
                gene,
                drug,
                &title,
                &pdf_path.to_string_lossy(),
                chunks.len() as i32,
                &elements_json,
            )
            .await?;

        let embedded = self.index.insert(&chunks).await?;
        tracing::info!("Embedded {} chunks for {}/{}", embedded, gene, drug);

        Ok(completed(
            format!(
                "Fetched, parsed, and ingested '{}': {} elements → {} chunks embedded.",
                pdf_name,
                elements.len(),
                embedded
            ),
            Some(guideline_id),
        ))
    }

    /// Probe the PDF directory for a previously-downloaded guideline whose
    /// filename contains the drug name.
    fn find_existing_pdf(&self, drug: &str) -> Option<PathBuf> {
        let needle = drug.to_lowercase();
        WalkDir::new(&self.pdf_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .find(|path| {
                let is_pdf = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case("pdf"))
                    .unwrap_or(false);
                let matches_drug = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|s| s.to_lowercase().contains(&needle))
                    .unwrap_or(false);
                is_pdf && matches_drug
            })
    }
}
