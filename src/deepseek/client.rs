//! DeepSeek API client implementation
//!
//! Direct client for DeepSeek's chat completion API (or any endpoint speaking the
//! same wire format), including function calling.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::env;
use std::time::Duration;

use super::types::*;
use crate::llm::LanguageModel;

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

/// DeepSeek API client
#[derive(Clone)]
pub struct DeepSeekClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl DeepSeekClient {
    /// Create a new DeepSeek client with robust configuration
    pub fn new(api_key: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(2)
            .user_agent(concat!("rig-coder/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: models::DEEPSEEK_CHAT.to_string(),
            max_tokens: Some(8000),
            temperature: Some(0.2),
        })
    }

    /// Build a client from `DEEPSEEK_API_KEY` and the optional `DEEPSEEK_BASE_URL`
    pub fn from_env() -> Result<Self> {
        let api_key =
            env::var("DEEPSEEK_API_KEY").context("DEEPSEEK_API_KEY environment variable not set")?;
        let client = Self::new(&api_key)?;
        Ok(match env::var("DEEPSEEK_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => client.with_base_url(&url),
            _ => client,
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a chat completion request and return the first choice's message
    pub async fn chat_completion_with_tools(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<Tool>>,
    ) -> Result<Message> {
        let request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: None,
            stream: false,
            tools,
        };

        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to DeepSeek API")?;

        let status = response.status();
        let response_text = response
            .text()
            .await
            .context("Failed to read response body")?;

        if !status.is_success() {
            if let Ok(error_response) = serde_json::from_str::<ErrorResponse>(&response_text) {
                return Err(anyhow!(
                    "DeepSeek API error: {} ({})",
                    error_response.error.message,
                    status
                ));
            }
            return Err(anyhow!(
                "DeepSeek API request failed with status {}: {}",
                status,
                response_text
            ));
        }

        let completion: ChatCompletionResponse = serde_json::from_str(&response_text)
            .context("Failed to parse chat completion response")?;

        if let Some(usage) = &completion.usage {
            tracing::debug!(
                "Token usage: prompt={} completion={} total={} cache_hit={:?}",
                usage.prompt_tokens,
                usage.completion_tokens,
                usage.total_tokens,
                usage.prompt_cache_hit_tokens
            );
        }

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| anyhow!("No choices returned from DeepSeek API"))
    }

    /// Send a chat completion request and return its text
    pub async fn chat_completion(&self, messages: Vec<Message>) -> Result<String> {
        let message = self.chat_completion_with_tools(messages, None).await?;
        Ok(message.text().to_string())
    }

    /// Create a tool whose parameters follow a JSON schema loosely
    pub fn create_tool(name: &str, description: &str, parameters: serde_json::Value) -> Tool {
        Tool {
            tool_type: "function".to_string(),
            function: Function {
                name: name.to_string(),
                description: description.to_string(),
                strict: None,
                parameters,
            },
        }
    }
}

#[async_trait]
impl LanguageModel for DeepSeekClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.chat_completion(vec![Message::user(prompt)]).await
    }

    async fn chat(&self, messages: Vec<Message>, tools: &[Tool]) -> Result<Message> {
        let tools = if tools.is_empty() {
            None
        } else {
            Some(tools.to_vec())
        };
        self.chat_completion_with_tools(messages, tools).await
    }
}
