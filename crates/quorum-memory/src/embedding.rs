use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Produces fixed-dimension embeddings for memory indexing and retrieval.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn model_id(&self) -> &str;
    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible `/embeddings` endpoint client.
#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Serialize)]
struct EmbeddingApiRequest {
    model: String,
    input: Vec<String>,
    encoding_format: String,
}

#[derive(Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingApiData>,
}

#[derive(Deserialize)]
struct EmbeddingApiData {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let endpoint = format!("{}/embeddings", self.base_url);
        let request = EmbeddingApiRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
            encoding_format: "float".to_string(),
        };

        let response = self
            .client
            .post(endpoint)
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .header(CONTENT_TYPE, "application/json")
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        let parsed: EmbeddingApiResponse = response.json().await?;
        let embeddings = extract_ordered_embeddings(parsed)?;

        if embeddings.len() != texts.len() {
            return Err(anyhow!(
                "embedding count mismatch: expected {}, got {}",
                texts.len(),
                embeddings.len()
            ));
        }
        if embeddings.iter().any(|e| e.len() != self.dimensions) {
            return Err(anyhow!(
                "embedding dimensions mismatch with configured dimensions {}",
                self.dimensions
            ));
        }

        Ok(embeddings)
    }

    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

fn extract_ordered_embeddings(response: EmbeddingApiResponse) -> Result<Vec<Vec<f32>>> {
    let mut data = response.data;
    data.sort_by_key(|item| item.index);
    for (expected, item) in data.iter().enumerate() {
        if item.index != expected {
            return Err(anyhow!(
                "missing or duplicated embedding index: expected {expected}, got {}",
                item.index
            ));
        }
    }
    Ok(data.into_iter().map(|item| item.embedding).collect())
}

/// Deterministic hash-based embedder for tests and offline runs.
#[derive(Clone)]
pub struct StubEmbedder {
    dims: usize,
}

impl StubEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                (0..self.dims)
                    .map(|index| Self::hash_to_unit_range(text, index))
                    .collect()
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
