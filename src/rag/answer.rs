use std::sync::Arc;

use anyhow::Result;

use crate::llm::CompletionModel;
use crate::models::{QueryResponse, Source};

use super::ChunkIndex;

const TOP_K: usize = 5;
const SNIPPET_CHARS: usize = 300;
const CONTEXT_DELIMITER: &str = "\n\n---\n\n";

const NO_INDEX_ANSWER: &str =
    "No guidelines have been indexed yet. Please ingest a guideline first.";
const NO_HITS_ANSWER: &str = "No relevant guideline sections found for your query.";

const ANSWER_PROMPT: &str = "You are a clinical pharmacogenomics expert. Answer the
question using ONLY the provided guideline excerpts. If the information
is not in the context, say so clearly. Always cite the guideline source.

Be precise about dosing recommendations, gene-drug interactions,
phenotype classifications, and activity scores.

When the data supports it, format your answer with:
- A summary table (using markdown table syntax) for phenotype-based recommendations
- Key points as a numbered or bulleted list
- Bold (**text**) for critical values like dose adjustments

Context:
{context}

Question: {question}

Answer:";

/// FAISS-style L2 distances come back ascending; map them into (0, 1] so a
/// perfect match scores 1.0. Bounded and order-preserving, not a probability.
fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Average similarity rescaled into a more intuitive band (retrieval
/// similarities typically land around 0.3-0.8), capped at 1.0.
fn confidence_from(similarities: &[f32]) -> f32 {
    if similarities.is_empty() {
        return 0.0;
    }
    let mean = similarities.iter().sum::<f32>() / similarities.len() as f32;
    round_to(f32::min(1.0, mean * 1.2), 2)
}

fn round_to(value: f32, decimals: u32) -> f32 {
    let factor = 10f32.powi(decimals as i32);
    (value * factor).round() / factor
}

fn snippet(text: &str) -> String {
    text.chars().take(SNIPPET_CHARS).collect()
}

pub struct AnswerEngine {
    index: Arc<dyn ChunkIndex>,
    llm: Arc<dyn CompletionModel>,
}

impl AnswerEngine {
    pub fn new(index: Arc<dyn ChunkIndex>, llm: Arc<dyn CompletionModel>) -> Self {
        Self { index, llm }
    }

    pub async fn answer(&self, gene: &str, drug: &str, question: &str) -> Result<QueryResponse> {
        if self.index.total_vector_count().await? == 0 {
            return Ok(QueryResponse {
                answer: NO_INDEX_ANSWER.to_string(),
                confidence: 0.0,
                model_used: "none".to_string(),
                sources: Vec::new(),
            });
        }

        let full_question = format!("Gene: {}, Drug: {}. {}", gene, drug, question);
        let hits = self.index.search_with_scores(&full_question, TOP_K).await?;

        if hits.is_empty() {
            return Ok(QueryResponse {
                answer: NO_HITS_ANSWER.to_string(),
                confidence: 0.0,
                model_used: self.llm.model_id().to_string(),
                sources: Vec::new(),
            });
        }

        let mut context_parts = Vec::new();
        let mut sources = Vec::new();
        let mut similarities = Vec::new();

        for (chunk, distance) in &hits {
            let similarity = similarity_from_distance(*distance);
            similarities.push(similarity);

            let preview = snippet(&chunk.text);
            context_parts.push(chunk.text.clone());
            sources.push(Source {
                title: chunk.title.clone(),
                section: chunk.element_type.clone(),
                page: chunk.page,
                text: preview.clone(),
                snippet: preview,
                score: round_to(similarity, 3),
            });
        }

        let context = context_parts.join(CONTEXT_DELIMITER);
        let confidence = confidence_from(&similarities);

        let prompt = ANSWER_PROMPT
            .replace("{context}", &context)
            .replace("{question}", &full_question);
        let answer = self.llm.complete(&prompt).await?;

        Ok(QueryResponse {
            answer,
            confidence,
            model_used: self.llm.model_id().to_string(),
            sources,
        })
    }
}
