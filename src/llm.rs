//! Chat completions with tool calling.
//!
//! Message and tool-call types mirror the OpenAI chat wire format, which
//! Azure OpenAI and Mistral accept as well, so they serialize straight into
//! request bodies. [`ChatClient`] is the hosted implementation of
//! [`ChatModel`]; the conversation loop only sees the trait, which keeps it
//! testable with scripted models.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::LlmConfig;
use crate::error::{api_key, ApiError};
use crate::http::{client_with_timeout, send_with_retry, JsonRequest};
use crate::rate_limit::{RateLimiter, RateLimits};

// ============ Messages ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text(Role::Assistant, content)
    }

    /// The result of tool call `tool_call_id`.
    pub fn tool(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, as sent by the model.
    #[serde(default, deserialize_with = "arguments_as_string")]
    pub arguments: String,
}

/// Some providers send arguments as an object rather than a string.
fn arguments_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_kind(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn to_openai_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub tools_enabled: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            tools_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

// ============ Model Trait ============

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// One completion. `tools` are only offered when
    /// `options.tools_enabled` is set.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<ChatCompletion>;

    /// Token usage accumulated over all completions.
    fn usage(&self) -> Usage {
        Usage::default()
    }
}

pub fn create_chat_model(config: &LlmConfig) -> Result<Arc<dyn ChatModel>> {
    Ok(Arc::new(ChatClient::new(config)?))
}

// ============ Hosted Client ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    AzureOpenAi,
    OpenAi,
    Mistral,
}

impl LlmProvider {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "azure-openai" => Ok(Self::AzureOpenAi),
            "openai" => Ok(Self::OpenAi),
            "mistral" => Ok(Self::Mistral),
            other => bail!("Unknown llm provider: {}", other),
        }
    }

    fn service(self) -> &'static str {
        match self {
            Self::AzureOpenAi => "Azure OpenAI",
            Self::OpenAi => "OpenAI",
            Self::Mistral => "Mistral",
        }
    }

    fn key_var(self) -> &'static str {
        match self {
            Self::AzureOpenAi => "AZURE_OPENAI_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Mistral => "MISTRAL_API_KEY",
        }
    }
}

/// Chat completions endpoint for `provider`.
pub fn completions_url(
    provider: LlmProvider,
    model: &str,
    endpoint: Option<&str>,
    api_version: &str,
) -> Result<String> {
    let base = endpoint.map(|e| e.trim_end_matches('/'));
    Ok(match provider {
        LlmProvider::AzureOpenAi => {
            let Some(base) = base else {
                bail!("llm.endpoint (or AZURE_OPENAI_ENDPOINT) required for azure-openai");
            };
            format!(
                "{}/openai/deployments/{}/chat/completions?api-version={}",
                base, model, api_version
            )
        }
        LlmProvider::OpenAi => format!(
            "{}/v1/chat/completions",
            base.unwrap_or("https://api.openai.com")
        ),
        LlmProvider::Mistral => format!(
            "{}/v1/chat/completions",
            base.unwrap_or("https://api.mistral.ai")
        ),
    })
}

pub fn request_body(
    model: &str,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    options: &CompletionOptions,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages,
        "temperature": options.temperature,
    });
    if options.tools_enabled && !tools.is_empty() {
        body["tools"] = Value::Array(tools.iter().map(|t| t.to_openai_json()).collect());
        body["tool_choice"] = json!("auto");
    }
    body
}

pub fn parse_response(service: &str, json: &Value) -> Result<ChatCompletion, ApiError> {
    let choice = json
        .pointer("/choices/0")
        .ok_or_else(|| ApiError::invalid_response(service, "no choices in response"))?;
    let message: ChatMessage = choice
        .get("message")
        .cloned()
        .map(serde_json::from_value::<ChatMessage>)
        .transpose()
        .map_err(|e| ApiError::invalid_response(service, e.to_string()))?
        .ok_or_else(|| ApiError::invalid_response(service, "choice has no message"))?;
    let finish_reason = choice
        .get("finish_reason")
        .and_then(|f| f.as_str())
        .map(str::to_string);
    let usage = json
        .get("usage")
        .cloned()
        .and_then(|u| serde_json::from_value(u).ok())
        .unwrap_or_default();

    Ok(ChatCompletion {
        message,
        finish_reason,
        usage,
    })
}

/// Rough token estimate used for the tokens-per-minute budget.
fn estimate_tokens(body: &Value) -> usize {
    body.to_string().len() / 4
}

/// Chat client for Azure OpenAI, OpenAI and Mistral.
pub struct ChatClient {
    client: reqwest::Client,
    provider: LlmProvider,
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    limiter: Mutex<RateLimiter>,
    usage: std::sync::Mutex<Usage>,
}

impl ChatClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let provider = LlmProvider::parse(&config.provider)?;
        Self::with_api_key(config, api_key(provider.key_var())?)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let provider = LlmProvider::parse(&config.provider)?;
        let url = completions_url(
            provider,
            &config.model,
            config.endpoint.as_deref(),
            &config.api_version,
        )?;
        Ok(Self {
            client: client_with_timeout(config.timeout_secs)?,
            provider,
            model: config.model.clone(),
            url,
            api_key,
            max_retries: config.max_retries,
            limiter: Mutex::new(RateLimiter::new(RateLimits {
                rpm: config.requests_per_minute,
                tpm: config.tokens_per_minute,
            })),
            usage: std::sync::Mutex::new(Usage::default()),
        })
    }

    async fn wait_for_budget(&self, estimated: usize) {
        loop {
            let wait = self.limiter.lock().await.check(estimated);
            match wait {
                Some(delay) => {
                    info!(delay_ms = delay.as_millis() as u64, "rate limit reached, waiting");
                    tokio::time::sleep(delay).await;
                }
                None => return,
            }
        }
    }
}

#[async_trait]
impl ChatModel for ChatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<ChatCompletion> {
        let service = self.provider.service();
        let body = request_body(&self.model, messages, tools, options);
        self.wait_for_budget(estimate_tokens(&body)).await;

        let req = JsonRequest::post(service, &self.url, &body);
        let req = match self.provider {
            LlmProvider::AzureOpenAi => req.header("api-key", &self.api_key),
            _ => req.bearer(&self.api_key),
        };

        let json = send_with_retry(&self.client, &req, self.max_retries).await?;
        let completion = parse_response(service, &json)?;

        self.limiter
            .lock()
            .await
            .record(completion.usage.total_tokens as usize);
        self.usage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(&completion.usage);
        debug!(
            model = %self.model,
            finish_reason = completion.finish_reason.as_deref().unwrap_or(""),
            tokens = completion.usage.total_tokens,
            "completion received"
        );

        Ok(completion)
    }

    fn usage(&self) -> Usage {
        *self.usage.lock().unwrap_or_else(|e| e.into_inner())
    }
}
