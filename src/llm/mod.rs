mod anthropic;
mod cohere;

pub use anthropic::{AnthropicClient, AnthropicConfig};
pub use cohere::{CohereClient, CohereConfig};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing api key for {0}")]
    MissingApiKey(&'static str),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("timed out after {0}s")]
    Timeout(u64),
}

/// Single-completion request for the primary provider.
#[derive(Debug, Clone)]
pub struct PrimaryRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Multi-candidate request for the variant provider.
#[derive(Debug, Clone)]
pub struct VariantRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub num_generations: u32,
}

#[async_trait]
pub trait PrimaryGenerator: Send + Sync {
    async fn complete(&self, request: PrimaryRequest) -> Result<String, LlmError>;
}

#[async_trait]
pub trait VariantGenerator: Send + Sync {
    async fn generate(&self, request: VariantRequest) -> Result<Vec<String>, LlmError>;
}
