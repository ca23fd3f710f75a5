use crate::models::{Chunk, RawElement};

/// Provenance tag for chunks produced by the parsing collaborator.
pub const PARSED_SOURCE: &str = "unstructured_api";

/// Elements shorter than this after trimming are noise (page headers,
/// bullet glyphs) and are dropped, not errors.
pub const MIN_CHUNK_CHARS: usize = 20;

/// Turn parsed elements into indexable chunks, in source order.
/// No deduplication or merging across elements.
pub fn extract_chunks(elements: &[RawElement], gene: &str, drug: &str) -> Vec<Chunk> {
    elements
        .iter()
        .filter_map(|elem| {
            let text = elem.text.trim();
            if text.chars().count() < MIN_CHUNK_CHARS {
                return None;
            }

            Some(Chunk {
                text: text.to_string(),
                title: elem
                    .metadata
                    .filename
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| format!("{}_{}", gene, drug)),
                page: elem.metadata.page_number.unwrap_or(0),
                gene: gene.to_string(),
                drug: drug.to_string(),
                element_type: elem.element_type.clone(),
                source: PARSED_SOURCE.to_string(),
            })
        })
        .collect()
}
