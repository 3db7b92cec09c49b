//! Local inference clients for completions (TGI / Ollama) and embeddings
//! (TEI / Ollama).

use async_trait::async_trait;
use kgfusion_core::{CompletionService, CoreError, Embedder, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TEI_URL: &str = "http://localhost:8081";
const DEFAULT_TEI_PROVIDER: &str = "tei";
const DEFAULT_OLLAMA_EMBED_MODEL: &str = "nomic-embed-text:latest";
const DEFAULT_TGI_URL: &str = "http://localhost:8082";
const DEFAULT_TGI_PROVIDER: &str = "tgi";
const DEFAULT_OLLAMA_MODEL: &str = "phi4-mini:latest";
const DEFAULT_OLLAMA_FORMAT: &str = "json";
const DEFAULT_TEI_MAX_BATCH: usize = 32;
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_NEW_TOKENS: u32 = 2048;

fn env_or_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_positive<T: std::str::FromStr + PartialOrd + Default>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .filter(|value| *value > T::default())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Hugging Face text-generation / text-embeddings inference
    HuggingFace,
    Ollama,
}

impl Provider {
    fn from_env(key: &str, default: &str) -> Self {
        if env_or_default(key, default).eq_ignore_ascii_case("ollama") {
            Provider::Ollama
        } else {
            Provider::HuggingFace
        }
    }
}

/// Map transport failures onto the core error taxonomy so callers can
/// decide whether to retry
fn classify(error: reqwest::Error) -> CoreError {
    if error.is_timeout() {
        return CoreError::Timeout(error.to_string());
    }
    match error.status() {
        Some(status) if is_throttled(status) => CoreError::RateLimited(error.to_string()),
        _ => CoreError::Service(error.to_string()),
    }
}

fn is_throttled(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE
}

async fn post_json<T: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    body: &T,
    timeout: Duration,
) -> Result<Value> {
    client
        .post(url)
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(classify)?
        .error_for_status()
        .map_err(classify)?
        .json::<Value>()
        .await
        .map_err(classify)
}

// ==========================================
// Embeddings
// ==========================================

#[derive(Clone)]
pub struct EmbeddingClient {
    client: Client,
    base_url: String,
    provider: Provider,
    model: String,
    max_batch: usize,
    timeout: Duration,
    /// Expected vector length; `None` accepts whatever the model returns
    dimension: Option<usize>,
}

impl EmbeddingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            provider: Provider::HuggingFace,
            model: DEFAULT_OLLAMA_EMBED_MODEL.to_string(),
            max_batch: DEFAULT_TEI_MAX_BATCH,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            dimension: None,
        }
    }

    /// Configure from `TEI_PROVIDER`, `TEI_URL`, `TEI_MODEL`,
    /// `TEI_MAX_BATCH` and `TEI_DIMENSION`
    pub fn default_local() -> Self {
        let provider = Provider::from_env("TEI_PROVIDER", DEFAULT_TEI_PROVIDER);
        let url = match provider {
            Provider::Ollama => env_or_default("TEI_URL", "http://localhost:11434"),
            Provider::HuggingFace => env_or_default("TEI_URL", DEFAULT_TEI_URL),
        };
        let mut client = Self::new(url).with_provider(provider);
        client.model = env_or_default("TEI_MODEL", DEFAULT_OLLAMA_EMBED_MODEL);
        client.max_batch = env_positive("TEI_MAX_BATCH", DEFAULT_TEI_MAX_BATCH);
        client.dimension = std::env::var("TEI_DIMENSION")
            .ok()
            .and_then(|value| value.trim().parse().ok());
        client
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<bool> {
        let url = match self.provider {
            Provider::HuggingFace => format!("{}/health", self.base_url),
            Provider::Ollama => format!("{}/api/tags", self.base_url),
        };
        let response = self.client.get(&url).send().await.map_err(classify)?;
        Ok(response.status().is_success())
    }

    async fn ollama_embed(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.base_url);
        let request = OllamaEmbedRequest {
            model: &self.model,
            prompt: text,
        };
        let response = post_json(&self.client, &url, &request, self.timeout).await?;
        let parsed: OllamaEmbedResponse = serde_json::from_value(response)?;
        Ok(parsed.embedding)
    }

    fn validate_dimension(&self, len: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != len => Err(CoreError::Validation(format!(
                "Embedding dimension {len} does not match expected {expected}"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = match self.provider {
            Provider::Ollama => self.ollama_embed(text).await?,
            Provider::HuggingFace => {
                let url = format!("{}/embed", self.base_url);
                let request = TeiEmbedRequest {
                    inputs: text,
                    truncate: true,
                };
                let response = post_json(&self.client, &url, &request, self.timeout).await?;
                parse_embedding_response(response)?
            }
        };
        self.validate_dimension(embedding.len())?;
        Ok(embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(texts.len());
        if self.provider == Provider::Ollama {
            for text in texts {
                results.push(self.embed(text).await?);
            }
            return Ok(results);
        }

        let url = format!("{}/embed", self.base_url);
        for chunk in texts.chunks(self.max_batch) {
            let request = TeiEmbedBatchRequest {
                inputs: chunk,
                truncate: true,
            };
            let response = post_json(&self.client, &url, &request, self.timeout).await?;
            let embeddings = parse_embeddings_response(response)?;
            if embeddings.len() != chunk.len() {
                return Err(CoreError::Service(format!(
                    "TEI returned {} embeddings for {} inputs",
                    embeddings.len(),
                    chunk.len()
                )));
            }
            for embedding in &embeddings {
                self.validate_dimension(embedding.len())?;
            }
            results.extend(embeddings);
        }
        debug!(count = results.len(), "Embedded batch");
        Ok(results)
    }
}

// ==========================================
// Completions
// ==========================================

#[derive(Clone)]
pub struct CompletionClient {
    client: Client,
    base_url: String,
    provider: Provider,
    model: String,
    max_new_tokens: u32,
    timeout: Duration,
}

impl CompletionClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            provider: Provider::HuggingFace,
            model: DEFAULT_OLLAMA_MODEL.to_string(),
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Configure from `TGI_PROVIDER`, `TGI_URL`, `TGI_MODEL`,
    /// `TGI_MAX_NEW_TOKENS` and `TGI_TIMEOUT_SECS`
    pub fn default_local() -> Self {
        let provider = Provider::from_env("TGI_PROVIDER", DEFAULT_TGI_PROVIDER);
        let url = match provider {
            Provider::Ollama => env_or_default("TGI_URL", "http://localhost:11434"),
            Provider::HuggingFace => env_or_default("TGI_URL", DEFAULT_TGI_URL),
        };
        let mut client = Self::new(url).with_provider(provider);
        client.model = env_or_default("TGI_MODEL", DEFAULT_OLLAMA_MODEL);
        client.max_new_tokens = env_positive("TGI_MAX_NEW_TOKENS", DEFAULT_MAX_NEW_TOKENS);
        client.timeout = Duration::from_secs(env_positive("TGI_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS));
        client
    }

    pub fn with_provider(mut self, provider: Provider) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<bool> {
        let url = match self.provider {
            Provider::HuggingFace => format!("{}/health", self.base_url),
            Provider::Ollama => format!("{}/api/tags", self.base_url),
        };
        let response = self.client.get(&url).send().await.map_err(classify)?;
        Ok(response.status().is_success())
    }

    async fn tgi_generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/generate", self.base_url);
        let request = TgiGenerateRequest {
            inputs: prompt,
            parameters: TgiParameters {
                max_new_tokens: self.max_new_tokens,
                return_full_text: false,
            },
        };
        let response = post_json(&self.client, &url, &request, self.timeout).await?;
        extract_generated_text(response)
    }

    async fn ollama_generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaGenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            format: Some(DEFAULT_OLLAMA_FORMAT),
        };
        let response = post_json(&self.client, &url, &request, self.timeout).await?;
        extract_generated_text(response)
    }
}

#[async_trait]
impl CompletionService for CompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let text = match self.provider {
            Provider::HuggingFace => self.tgi_generate(prompt).await?,
            Provider::Ollama => self.ollama_generate(prompt).await?,
        };
        debug!(prompt_len = prompt.len(), response_len = text.len(), "Completion returned");
        Ok(text)
    }
}

#[derive(Serialize)]
struct TeiEmbedRequest<'a> {
    inputs: &'a str,
    truncate: bool,
}

#[derive(Serialize)]
struct TeiEmbedBatchRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

#[derive(Serialize)]
struct TgiGenerateRequest<'a> {
    inputs: &'a str,
    parameters: TgiParameters,
}

#[derive(Serialize)]
struct TgiParameters {
    max_new_tokens: u32,
    return_full_text: bool,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

fn parse_embedding_response(value: Value) -> Result<Vec<f32>> {
    let mut embeddings = parse_embeddings_response(value)?;
    if embeddings.is_empty() {
        return Err(CoreError::Service("Missing embeddings".to_string()));
    }
    Ok(embeddings.swap_remove(0))
}

/// TEI answers `[[f32..]..]`; a flat `[f32..]` is one embedding
fn parse_embeddings_response(value: Value) -> Result<Vec<Vec<f32>>> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Ok(Vec::new());
            }
            if items.first().map(Value::is_array).unwrap_or(false) {
                serde_json::from_value(Value::Array(items)).map_err(|e| {
                    CoreError::Service(format!("Invalid TEI embeddings response: {e}"))
                })
            } else {
                let single: Vec<f32> = serde_json::from_value(Value::Array(items))
                    .map_err(|e| CoreError::Service(format!("Invalid TEI embedding array: {e}")))?;
                Ok(vec![single])
            }
        }
        other => Err(CoreError::Service(format!(
            "Unexpected TEI response format: {other}"
        ))),
    }
}

fn extract_generated_text(value: Value) -> Result<String> {
    match value {
        Value::Array(mut items) => {
            let first = items
                .pop()
                .ok_or_else(|| CoreError::Service("Empty TGI response array".to_string()))?;
            extract_generated_text(first)
        }
        Value::Object(mut obj) => {
            if let Some(Value::String(text)) = obj.remove("generated_text") {
                Ok(text)
            } else if let Some(Value::String(text)) = obj.remove("response") {
                Ok(text)
            } else {
                Err(CoreError::Service(
                    "Completion response missing generated text field".to_string(),
                ))
            }
        }
        other => Err(CoreError::Service(format!(
            "Unexpected completion response format: {other}"
        ))),
    }
}
