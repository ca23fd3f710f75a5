use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;

use crate::config::Settings;
use crate::models::RawElement;

const PARTITION_STRATEGY: &str = "hi_res";

#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Parse a PDF into an ordered sequence of typed text elements.
    /// Fails on malformed input or service unavailability.
    async fn parse(&self, path: &Path) -> Result<Vec<RawElement>>;
}

/// Client for an Unstructured-compatible partition endpoint.
pub struct UnstructuredClient {
    client: Client,
    partition_url: String,
    api_key: String,
}

impl UnstructuredClient {
    pub fn new(settings: &Settings) -> Self {
        let partition_url = format!(
            "{}/general/v0/general",
            settings.unstructured_url.trim_end_matches('/')
        );
        Self {
            client: Client::new(),
            partition_url,
            api_key: settings.unstructured_api_key.clone(),
        }
    }
}

#[async_trait]
impl DocumentParser for UnstructuredClient {
    async fn parse(&self, path: &Path) -> Result<Vec<RawElement>> {
        if !path.exists() {
            anyhow::bail!("PDF not found: {}", path.display());
        }
        if self.api_key.is_empty() {
            anyhow::bail!("UNSTRUCTURED_API_KEY is not set in environment");
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        tracing::info!("Submitting '{}' to the Unstructured API...", file_name);

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read PDF: {}", path.display()))?;

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("application/pdf")?;
        let form = multipart::Form::new()
            .part("files", part)
            .text("strategy", PARTITION_STRATEGY);

        let response = self
            .client
            .post(&self.partition_url)
            .header("unstructured-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Unstructured API error: {} - {}", status, error_text);
        }

        let elements: Vec<RawElement> = response.json().await?;
        tracing::info!("Parsed {} elements from '{}'", elements.len(), file_name);
        Ok(elements)
    }
}

#[cfg(test)]
mod tests {
    use crate::models::RawElement;

    #[test]
    fn test_element_deserialization_keeps_unknown_metadata() {
        let json = r#"[{
            "type": "Title",
            "text": "Codeine Therapy Guideline",
            "metadata": {
                "page_number": 1,
                "filename": "CYP2D6_codeine_Guideline.pdf",
                "languages": ["eng"]
            }
        }]"#;

        let elements: Vec<RawElement> = serde_json::from_str(json).unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].element_type, "Title");
        assert_eq!(elements[0].metadata.page_number, Some(1));
        assert!(elements[0].metadata.extra.contains_key("languages"));

        // Round-trips so the stored record keeps the extra keys
        let back = serde_json::to_value(&elements).unwrap();
        assert_eq!(back[0]["metadata"]["languages"][0], "eng");
    }

    #[test]
    fn test_element_deserialization_tolerates_missing_fields() {
        let elements: Vec<RawElement> = serde_json::from_str(r#"[{"text": "bare"}]"#).unwrap();
        assert_eq!(elements[0].element_type, "");
        assert_eq!(elements[0].metadata.page_number, None);
    }
}
