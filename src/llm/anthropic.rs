use super::{LlmError, PrimaryGenerator, PrimaryRequest};
use crate::{config::ANTHROPIC_API_URL, config::HttpSettings, http::build_client};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl AnthropicConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: ANTHROPIC_API_URL.clone(),
            api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            model: std::env::var("ANTHROPIC_MODEL")
                .unwrap_or_else(|_| "claude-3-5-sonnet-latest".into()),
        }
    }
}

pub struct AnthropicClient {
    http: Client,
    config: AnthropicConfig,
}

impl AnthropicClient {
    pub fn new(config: AnthropicConfig, http: HttpSettings) -> Self {
        Self {
            http: build_client(http),
            config,
        }
    }
}

#[async_trait]
impl PrimaryGenerator for AnthropicClient {
    async fn complete(&self, request: PrimaryRequest) -> Result<String, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey("anthropic"))?;

        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .http
            .post(format!(
                "{}/v1/messages",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: MessagesResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        payload
            .content
            .into_iter()
            .find(|block| block.r#type == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| LlmError::InvalidResponse("missing text block".into()))
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    r#type: String,
    #[serde(default)]
    text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_key_fails_before_network() {
        let client = AnthropicClient::new(
            AnthropicConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: None,
                model: "test".into(),
            },
            HttpSettings::default(),
        );
        let err = client
            .complete(PrimaryRequest {
                system: "s".into(),
                prompt: "p".into(),
                max_tokens: 10,
                temperature: 0.7,
            })
            .await
            .expect_err("no key");
        assert!(matches!(err, LlmError::MissingApiKey("anthropic")));
    }

    #[test]
    fn response_text_block_parses() {
        let raw = r#"{"id":"m","content":[{"type":"text","text":"hello"}],"usage":{"input_tokens":1}}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.content[0].text.as_deref(), Some("hello"));
    }
}
