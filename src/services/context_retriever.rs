use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{bson::doc, Database};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::rubric::RetrievalSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub title: String,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub slide: Option<u32>,
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub text: String,
    pub similarity: f64,
    pub metadata: ChunkMetadata,
}

/// Similarity search over a single document's chunks, consumed as a
/// black-box capability.
#[async_trait]
pub trait SemanticSearch: Send + Sync {
    async fn search(&self, query: &str, document_id: &str, limit: usize)
        -> Result<Vec<ChunkMatch>>;
}

/// HTTP adapter for the embedding service.
pub struct HttpSemanticSearch {
    client: reqwest::Client,
    api_url: String,
}

impl HttpSemanticSearch {
    pub fn new(api_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { client, api_url })
    }
}

#[async_trait]
impl SemanticSearch for HttpSemanticSearch {
    async fn search(
        &self,
        query: &str,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let url = format!("{}/v1/search", self.api_url);
        let body = serde_json::json!({
            "query": query,
            "document_id": document_id,
            "limit": limit,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to call semantic search service")?;

        if !response.status().is_success() {
            anyhow::bail!("Semantic search returned status: {}", response.status());
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            results: Vec<ChunkMatch>,
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed.results)
    }
}

/// Course material record, as far as retrieval eligibility is concerned.
#[derive(Debug, Clone, Deserialize)]
struct CourseDocument {
    #[serde(rename = "_id")]
    id: String,
    title: String,
    #[serde(default)]
    embedding_status: Option<String>,
    #[serde(default)]
    is_testbank: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub has_context: bool,
    pub chunks: Vec<ChunkMatch>,
    pub formatted_text: String,
    pub sources: Vec<String>,
}

pub struct ContextRetriever {
    mongo: Database,
    search: Arc<dyn SemanticSearch>,
}

impl ContextRetriever {
    pub fn new(mongo: Database, search: Arc<dyn SemanticSearch>) -> Self {
        Self { mongo, search }
    }

    /// Retrieves ranked course-material chunks for a question+answer pair.
    /// Zero chunks above the threshold is a normal outcome, not an error.
    pub async fn retrieve(
        &self,
        question_text: &str,
        answer_text: &str,
        module_id: &str,
        settings: &RetrievalSettings,
    ) -> Result<RetrievalResult> {
        let documents = self.eligible_documents(module_id).await?;
        if documents.is_empty() {
            tracing::debug!(module_id = %module_id, "No embedded documents for retrieval");
            return Ok(RetrievalResult::default());
        }

        let query = build_query(question_text, answer_text);

        let mut all_chunks = Vec::new();
        for document in &documents {
            match self
                .search
                .search(&query, &document.id, settings.max_chunks)
                .await
            {
                Ok(mut chunks) => {
                    for chunk in &mut chunks {
                        if chunk.metadata.title.is_empty() {
                            chunk.metadata.title = document.title.clone();
                        }
                    }
                    all_chunks.extend(chunks);
                }
                Err(err) => {
                    // One bad document should not kill retrieval for the rest.
                    tracing::warn!(
                        document_id = %document.id,
                        error = %err,
                        "Semantic search failed for document"
                    );
                }
            }
        }

        let selected = select_chunks(
            all_chunks,
            settings.similarity_threshold,
            settings.max_chunks,
        );
        if selected.is_empty() {
            return Ok(RetrievalResult::default());
        }

        let formatted_text = format_context(&selected, settings.include_source_locations);
        let mut sources: Vec<String> = selected
            .iter()
            .map(|chunk| chunk.metadata.title.clone())
            .collect();
        sources.dedup();

        Ok(RetrievalResult {
            has_context: true,
            chunks: selected,
            formatted_text,
            sources,
        })
    }

    /// Only fully embedded, non-testbank documents are searchable; testbank
    /// material would leak answers through retrieval.
    async fn eligible_documents(&self, module_id: &str) -> Result<Vec<CourseDocument>> {
        let cursor = self
            .mongo
            .collection::<CourseDocument>("documents")
            .find(doc! {
                "module_id": module_id,
                "embedding_status": "completed",
                "is_testbank": { "$ne": true },
            })
            .await
            .context("Failed to query documents for retrieval")?;

        let documents = cursor
            .try_collect()
            .await
            .context("Document cursor error")?;
        Ok(documents)
    }
}

pub fn build_query(question_text: &str, answer_text: &str) -> String {
    format!("Question: {}\nAnswer: {}", question_text, answer_text)
}

/// Threshold filter, descending sort, top-k truncation.
pub fn select_chunks(mut chunks: Vec<ChunkMatch>, threshold: f64, max_chunks: usize) -> Vec<ChunkMatch> {
    chunks.retain(|chunk| chunk.similarity >= threshold);
    chunks.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    chunks.truncate(max_chunks);
    chunks
}

/// Renders chunks as a delimited context block with source annotations and
/// citation instructions for the feedback generator.
pub fn format_context(chunks: &[ChunkMatch], include_locations: bool) -> String {
    let mut out = String::from("RELEVANT COURSE MATERIAL:\n\n");

    for (idx, chunk) in chunks.iter().enumerate() {
        let mut origin = format!("From: {}", chunk.metadata.title);
        if include_locations {
            let mut location_parts = Vec::new();
            if let Some(page) = chunk.metadata.page {
                location_parts.push(format!("Page {}", page));
            }
            if let Some(slide) = chunk.metadata.slide {
                location_parts.push(format!("Slide {}", slide));
            }
            if let Some(section) = &chunk.metadata.section {
                location_parts.push(section.clone());
            }
            if !location_parts.is_empty() {
                origin.push_str(&format!(" ({})", location_parts.join(", ")));
            }
        }

        out.push_str(&format!(
            "[Source {}] {} (Relevance: {:.0}%)\n{}\n\n",
            idx + 1,
            origin,
            chunk.similarity * 100.0,
            chunk.text.trim()
        ));
    }

    if include_locations {
        out.push_str(
            "When referring to the material above, cite the source document and its \
             page/slide/section so the student can look it up.\n",
        );
    } else {
        out.push_str(
            "When referring to the material above, do not mention page, slide, or \
             section locations.\n",
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(similarity: f64, title: &str) -> ChunkMatch {
        ChunkMatch {
            text: "The cell membrane regulates transport.".to_string(),
            similarity,
            metadata: ChunkMetadata {
                title: title.to_string(),
                page: Some(12),
                slide: None,
                section: Some("Transport".to_string()),
            },
        }
    }

    #[test]
    fn selection_filters_sorts_and_truncates() {
        let chunks = vec![chunk(0.6, "a"), chunk(0.9, "b"), chunk(0.4, "c")];
        let selected = select_chunks(chunks, 0.7, 3);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.title, "b");
    }

    #[test]
    fn formatting_includes_locations_and_relevance() {
        let formatted = format_context(&[chunk(0.87, "Biology Slides")], true);
        assert!(formatted.contains("[Source 1]"));
        assert!(formatted.contains("From: Biology Slides (Page 12, Transport)"));
        assert!(formatted.contains("(Relevance: 87%)"));
        assert!(formatted.contains("cite the source document"));
    }

    #[test]
    fn formatting_can_suppress_locations() {
        let formatted = format_context(&[chunk(0.8, "Notes")], false);
        assert!(!formatted.contains("Page 12"));
        assert!(formatted.contains("do not mention page"));
    }

    #[test]
    fn query_combines_question_and_answer() {
        assert_eq!(
            build_query("What is osmosis?", "water movement"),
            "Question: What is osmosis?\nAnswer: water movement"
        );
    }
}
