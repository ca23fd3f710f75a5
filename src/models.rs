use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

// Query API

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub gene: Option<String>,
    #[serde(default)]
    pub drug: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub section: Option<String>,
    pub page: u32,
    pub text: String,
    pub snippet: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub confidence: f32,
    pub model_used: String,
    pub sources: Vec<Source>,
}

// Ingest API

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub gene: String,
    pub drug: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: IngestStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guideline_id: Option<String>,
}

/// One Gene/Drug row of the CPIC reference spreadsheet, serialized with the
/// spreadsheet's own column capitalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneDrugPair {
    #[serde(rename = "Gene")]
    pub gene: String,
    #[serde(rename = "Drug")]
    pub drug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOptions {
    pub genes: Vec<String>,
    pub drugs: Vec<String>,
    pub pairs: Vec<GeneDrugPair>,
}

// Phenotype API

#[derive(Debug, Clone, Deserialize)]
pub struct PhenotypeRequest {
    pub gene: String,
    pub diplotype: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhenotypeResponse {
    pub gene: String,
    pub diplotype: String,
    pub phenotype: String,
    pub activity_score: Option<f64>,
    pub recommendation: String,
    pub ehr_priority: String,
    pub description: String,
}

// Status API

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub indexed_guidelines: i64,
    pub total_chunks: u64,
    pub embedding_model: String,
}

// Parsed document elements

/// One element of a parsed guideline, as returned by the document parser.
/// Unknown metadata keys are preserved so the stored record stays faithful
/// to the parser output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawElement {
    #[serde(rename = "type", default)]
    pub element_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: ElementMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElementMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

// Retrieval units

/// A unit of guideline text ready for embedding, tagged with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub title: String,
    pub page: u32,
    pub gene: String,
    pub drug: String,
    pub element_type: String,
    pub source: String,
}

/// Chunk metadata as it comes back from a similarity search.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub text: String,
    pub title: String,
    pub page: u32,
    pub element_type: Option<String>,
}
