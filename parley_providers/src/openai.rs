use std::time::Duration;

use async_trait::async_trait;
use parley_core::{AgentConfig, ChatMessage, CompletionClient, CompletionError};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info};

/// Default system prompt when an agent has no persona.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

const DEFAULT_CONFIG_FIELD: &str = "agent_config";

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
///
/// Makes exactly one request per call; retry decisions belong to the caller.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    config_field: Option<String>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, model: String, timeout: Duration) -> anyhow::Result<Self> {
        info!("Creating OpenAiProvider for model {model}");
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model,
            config_field: Some(DEFAULT_CONFIG_FIELD.to_string()),
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Request field carrying `memory_state` and `tool_blocks`; `None`
    /// leaves them out for endpoints that reject unknown fields.
    #[must_use]
    pub fn with_config_field(mut self, field: Option<String>) -> Self {
        self.config_field = field;
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Build the request body for one completion.
    #[must_use]
    pub fn build_request(&self, context: &[ChatMessage], config: &AgentConfig) -> Value {
        let system = if config.persona.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT.to_string()
        } else {
            format!("You are the {} agent.", config.persona.trim())
        };

        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.push(json!({ "role": "system", "content": system }));
        messages.extend(
            context
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
        );

        let mut request = json!({
            "model": self.model,
            "messages": messages,
        });

        if let Some(field) = &self.config_field {
            request[field.as_str()] = json!({
                "memory_state": config.memory_state,
                "tool_blocks": config.tool_blocks,
            });
        }

        request
    }

    async fn try_send(&self, request: &Value) -> Result<String, CompletionError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let body = response
            .json::<Value>()
            .await
            .map_err(|e| CompletionError::Permanent(format!("Invalid response body: {e}")))?;

        parse_reply(&body)
    }
}

/// Map an HTTP error status to a completion failure.
#[must_use]
pub fn classify_status(status: StatusCode, body: &str) -> CompletionError {
    let message = format!("{status}: {}", body.chars().take(500).collect::<String>());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        CompletionError::Transient(message)
    } else {
        CompletionError::Permanent(message)
    }
}

fn classify_transport(e: &reqwest::Error) -> CompletionError {
    if e.is_builder() || e.is_decode() {
        CompletionError::Permanent(e.to_string())
    } else {
        CompletionError::Transient(e.to_string())
    }
}

/// Extract the reply text from a chat-completions response.
pub fn parse_reply(body: &Value) -> Result<String, CompletionError> {
    body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            CompletionError::Permanent("Invalid response format: missing content".to_string())
        })
}

#[async_trait]
impl CompletionClient for OpenAiProvider {
    async fn complete(
        &self,
        context: &[ChatMessage],
        config: &AgentConfig,
    ) -> Result<String, CompletionError> {
        let request = self.build_request(context, config);

        info!(
            "Sending completion request: model={}, messages={}",
            self.model,
            context.len()
        );
        let reply = self.try_send(&request).await?;
        debug!("Received completion of {} chars", reply.len());
        Ok(reply)
    }
}
