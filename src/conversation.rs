//! Conversation state and the routing-agent loop.
//!
//! One user turn runs as follows:
//!
//! 1. Load the conversation history; seed it with the system prompt if it
//!    is new.
//! 2. Append the user message and ask the model, offering the registered
//!    tools.
//! 3. While the model answers with tool calls, execute them in order,
//!    append their results as `tool` messages and ask again.
//! 4. After `max_tool_rounds` rounds of tool calls, ask one last time with
//!    tools disabled so the turn always ends with an answer.
//! 5. Store the history and reply.
//!
//! Progress is reported as [`AgentEvent`]s through an [`EventSink`]: the
//! WebSocket server forwards them to the browser, the CLI prints them, and
//! without a client they are only logged.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::llm::{create_chat_model, ChatMessage, ChatModel, CompletionOptions, ToolCall};
use crate::models::{InputMessage, OutputMessage};
use crate::prompts::ROUTING_AGENT_SYSTEM_PROMPT;
use crate::tools::ToolRegistry;
use crate::vector_store::create_vector_store;

// ============ Store ============

#[derive(Debug, Clone)]
struct StoredConversation {
    messages: Vec<ChatMessage>,
    last_update: DateTime<Utc>,
}

/// In-memory conversation histories keyed by conversation id.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct ConversationStore {
    inner: Arc<Mutex<HashMap<String, StoredConversation>>>,
    turns: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored messages, or an empty history for an unknown id.
    pub fn history(&self, conversation_id: &str) -> Vec<ChatMessage> {
        self.lock()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn save(&self, conversation_id: &str, messages: Vec<ChatMessage>) {
        self.lock().insert(
            conversation_id.to_string(),
            StoredConversation {
                messages,
                last_update: Utc::now(),
            },
        );
    }

    pub fn last_update(&self, conversation_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(conversation_id).map(|c| c.last_update)
    }

    pub fn remove(&self, conversation_id: &str) -> bool {
        self.turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conversation_id);
        self.lock().remove(conversation_id).is_some()
    }

    /// Wait until no other turn of `conversation_id` is running. Turns of
    /// one conversation run one at a time; different conversations don't
    /// block each other.
    pub async fn begin_turn(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let turn = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conversation_id.to_string())
            .or_default()
            .clone();
        turn.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredConversation>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============ Events ============

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    UserMessage { message: String },
    ToolCall { name: String, arguments: String },
    ToolResult { name: String, result: String },
    AssistantMessage { message: String },
    Error { message: String },
}

impl fmt::Display for AgentEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentEvent::UserMessage { message } => write!(f, "👤: {}", message),
            AgentEvent::ToolCall { name, arguments } => {
                write!(f, "    🛠️ \"{}\" {}", name, arguments)
            }
            AgentEvent::ToolResult { result, .. } => {
                write!(f, "    🛠️ Tool ended with result: {}", result)
            }
            AgentEvent::AssistantMessage { message } => write!(f, "🤖: {}", message),
            AgentEvent::Error { message } => write!(f, "⚠️: {}", message),
        }
    }
}

/// Receives the events of a turn as they happen.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &AgentEvent);
}

/// Logs events at debug level; used when no client is attached.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn send(&self, event: &AgentEvent) {
        debug!("no client attached, event: {}", event);
    }
}

/// Prints event lines to stdout.
pub struct StdoutSink;

#[async_trait]
impl EventSink for StdoutSink {
    async fn send(&self, event: &AgentEvent) {
        println!("{}", event);
    }
}

/// Forwards events to a channel, e.g. the writer half of a WebSocket.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: &AgentEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!("event receiver dropped: {}", event);
        }
    }
}

// ============ Handler ============

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tool_rounds: usize,
    /// Pause before each tool execution.
    pub tool_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            system_prompt: ROUTING_AGENT_SYSTEM_PROMPT.to_string(),
            temperature: 0.7,
            max_tool_rounds: 8,
            tool_delay: Duration::from_millis(500),
        }
    }
}

impl AgentSettings {
    /// Settings from `[agent]` and `[llm]`, reading the system prompt file
    /// when one is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let system_prompt = match &config.agent.system_prompt_path {
            Some(path) => std::fs::read_to_string(path).with_context(|| {
                format!("Failed to read system prompt {}", path.display())
            })?,
            None => ROUTING_AGENT_SYSTEM_PROMPT.to_string(),
        };
        Ok(Self {
            system_prompt,
            temperature: config.llm.temperature,
            max_tool_rounds: config.agent.max_tool_rounds,
            tool_delay: Duration::from_millis(config.agent.tool_delay_ms),
        })
    }
}

pub struct ConversationHandler {
    model: Arc<dyn ChatModel>,
    tools: Arc<ToolRegistry>,
    store: ConversationStore,
    settings: AgentSettings,
}

impl ConversationHandler {
    pub fn new(
        model: Arc<dyn ChatModel>,
        tools: Arc<ToolRegistry>,
        store: ConversationStore,
        settings: AgentSettings,
    ) -> Self {
        Self {
            model,
            tools,
            store,
            settings,
        }
    }

    /// Wire the hosted chat model, embedder and vector store from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let collection = config
            .vector_store
            .collection
            .clone()
            .context("vector_store.collection (or QDRANT_COLLECTION) must be set to answer questions")?;
        let model = create_chat_model(&config.llm)?;
        let embedder = create_embedder(&config.embedding)?;
        let store = create_vector_store(&config.vector_store)?;
        let tools = ToolRegistry::for_agent(
            embedder,
            store,
            collection,
            model.clone(),
            &config.agent,
            config.llm.temperature,
        );
        Ok(Self::new(
            model,
            Arc::new(tools),
            ConversationStore::new(),
            AgentSettings::from_config(config)?,
        ))
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn model(&self) -> &dyn ChatModel {
        self.model.as_ref()
    }

    /// Run one user turn. Concurrent turns of the same conversation are
    /// queued.
    ///
    /// On error nothing is stored, so the conversation stays as it was
    /// before the turn.
    pub async fn handle(&self, input: &InputMessage, sink: &dyn EventSink) -> Result<OutputMessage> {
        info!(
            conversation_id = %input.conversation_id,
            correlation_id = %input.correlation_id,
            "turn started"
        );

        let _turn = self.store.begin_turn(&input.conversation_id).await;
        let mut messages = self.store.history(&input.conversation_id);
        if messages.is_empty() {
            messages.push(ChatMessage::system(self.settings.system_prompt.as_str()));
        }

        sink.send(&AgentEvent::UserMessage {
            message: input.message.clone(),
        })
        .await;
        messages.push(ChatMessage::user(input.message.as_str()));

        let answer = self.route(&mut messages, sink).await?;

        sink.send(&AgentEvent::AssistantMessage {
            message: answer.clone(),
        })
        .await;
        self.store.save(&input.conversation_id, messages);

        info!(conversation_id = %input.conversation_id, "turn finished");
        Ok(OutputMessage::reply_to(input, answer))
    }

    async fn route(&self, messages: &mut Vec<ChatMessage>, sink: &dyn EventSink) -> Result<String> {
        let definitions = self.tools.definitions();
        let mut rounds = 0;

        loop {
            let options = CompletionOptions {
                temperature: self.settings.temperature,
                tools_enabled: rounds < self.settings.max_tool_rounds,
            };
            let completion = self.model.complete(messages, &definitions, &options).await?;

            let mut reply = completion.message;
            if !options.tools_enabled && !reply.tool_calls.is_empty() {
                debug!("dropping tool calls requested after the last tool round");
                reply.tool_calls.clear();
                reply.content.get_or_insert_with(String::new);
            }
            let calls = reply.tool_calls.clone();
            let content = reply.content_str().to_string();
            messages.push(reply);

            if calls.is_empty() {
                return Ok(content);
            }

            rounds += 1;
            for call in &calls {
                let result = self.run_tool_call(call, sink).await;
                messages.push(ChatMessage::tool(
                    call.id.as_str(),
                    call.function.name.as_str(),
                    result,
                ));
            }
        }
    }

    async fn run_tool_call(&self, call: &ToolCall, sink: &dyn EventSink) -> String {
        let name = &call.function.name;
        sink.send(&AgentEvent::ToolCall {
            name: name.clone(),
            arguments: call.function.arguments.clone(),
        })
        .await;

        if !self.settings.tool_delay.is_zero() {
            tokio::time::sleep(self.settings.tool_delay).await;
        }
        let result = self.tools.execute(name, &call.function.arguments).await;
        info!(tool = %name, "tool executed");

        sink.send(&AgentEvent::ToolResult {
            name: name.clone(),
            result: result.clone(),
        })
        .await;
        result
    }
}
