use super::{LlmError, VariantGenerator, VariantRequest};
use crate::{config::COHERE_API_URL, config::HttpSettings, http::build_client};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CohereConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl CohereConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: COHERE_API_URL.clone(),
            api_key: std::env::var("COHERE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            model: std::env::var("COHERE_MODEL").unwrap_or_else(|_| "command".into()),
        }
    }
}

pub struct CohereClient {
    http: Client,
    config: CohereConfig,
}

impl CohereClient {
    pub fn new(config: CohereConfig, http: HttpSettings) -> Self {
        Self {
            http: build_client(http),
            config,
        }
    }
}

#[async_trait]
impl VariantGenerator for CohereClient {
    async fn generate(&self, request: VariantRequest) -> Result<Vec<String>, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey("cohere"))?;

        let body = GenerateRequest {
            model: &self.config.model,
            prompt: &request.prompt,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            num_generations: request.num_generations,
        };

        let response = self
            .http
            .post(format!(
                "{}/v1/generate",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        Ok(payload.generations.into_iter().map(|g| g.text).collect())
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    temperature: f32,
    num_generations: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    generations: Vec<Generation>,
}

#[derive(Debug, Deserialize)]
struct Generation {
    text: String,
}
