//! Local inference, embedding and vision backends (Ollama HTTP API).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::config::AgentConfig;
use crate::error::{Error, Result};

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            format: None,
            stream: false,
            images: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Ask the backend to constrain its output to JSON.
    pub fn json(mut self) -> Self {
        self.format = Some("json".to_string());
        self
    }

    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct OllamaError {
    error: String,
}

/// Produces text completions.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Returns the raw `response` text.
    async fn generate(&self, request: GenerateRequest) -> Result<String>;
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Describes an image file in prose.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    async fn describe(&self, image: &Path, prompt: &str) -> Result<String>;
}

/// Client for a local Ollama server.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    embed_model: String,
    vision_model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.inference_timeout)
            .build()
            .map_err(|e| Error::Backend(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.ollama_host.trim_end_matches('/').to_string(),
            embed_model: config.embed_model.clone(),
            vision_model: config.vision_model.clone(),
            timeout: config.inference_timeout,
        })
    }

    /// Check whether the server answers at all.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        self.client.get(&url).send().await.is_ok()
    }

    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R> {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(self.timeout.as_millis() as u64)
                } else if e.is_connect() {
                    Error::Backend(format!(
                        "failed to connect to Ollama at {}. Is Ollama running?",
                        self.base_url
                    ))
                } else {
                    Error::Backend(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout.as_millis() as u64)
            } else {
                Error::Backend(e.to_string())
            }
        })?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<OllamaError>(&body) {
                return Err(Error::Backend(err.error));
            }
            return Err(Error::Backend(format!("HTTP {}", status)));
        }

        serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(format!("{}: {}", e, body)))
    }
}

#[async_trait]
impl InferenceBackend for OllamaClient {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn generate(&self, request: GenerateRequest) -> Result<String> {
        let response: GenerateResponse = self.post("/api/generate", &request).await?;
        debug!("Raw model response: {}", response.response);
        Ok(response.response)
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaClient {
    #[instrument(skip(self, text), fields(text_len = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embed_model,
            prompt: text,
        };
        let response: EmbeddingResponse = self.post("/api/embeddings", &request).await?;

        if response.embedding.is_empty() {
            return Err(Error::InvalidResponse("empty embedding".to_string()));
        }
        Ok(response.embedding)
    }
}

#[async_trait]
impl VisionBackend for OllamaClient {
    #[instrument(skip(self, prompt))]
    async fn describe(&self, image: &Path, prompt: &str) -> Result<String> {
        let bytes = tokio::fs::read(image).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);

        let request =
            GenerateRequest::new(self.vision_model.clone(), prompt).with_images(vec![encoded]);
        self.generate(request).await
    }
}
