//! Tools the routing agent can call.
//!
//! A [`Tool`] advertises a name, a description and a JSON Schema for its
//! arguments; the [`ToolRegistry`] turns model tool calls (name + JSON
//! argument string) into tool executions and always returns a string for
//! the model, so a failing tool never aborts a conversation turn.
//!
//! # Built-in tools
//!
//! | Tool | Arguments | Result |
//! |------|-----------|--------|
//! | `get_context` | `search_query`, `limit?` | scored points from the vector store |
//! | `math_reasoning` | `question`, `context` | step-by-step procedure text |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::config::AgentConfig;
use crate::embedding::{embed_query, Embedder};
use crate::llm::{ChatMessage, ChatModel, CompletionOptions, ToolDefinition};
use crate::prompts::math_reasoning_system_prompt;
use crate::vector_store::VectorStore;

#[async_trait]
pub trait Tool: Send + Sync {
    /// Name the model calls the tool by (lowercase with underscores).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool with arguments already checked against
    /// [`parameters_schema`](Tool::parameters_schema).
    async fn execute(&self, params: Value) -> Result<Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

// ============ Registry ============

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with `get_context` and `math_reasoning` wired to the given
    /// clients.
    pub fn for_agent(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        model: Arc<dyn ChatModel>,
        agent: &AgentConfig,
        temperature: f32,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(MathReasoningTool::new(model, temperature)));
        registry.register(Box::new(GetContextTool::new(
            embedder,
            store,
            collection,
            agent.default_context_limit,
            agent.max_context_limit,
        )));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Definitions of every registered tool, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Execute tool `name` with JSON-encoded `arguments`.
    ///
    /// Never fails: unknown tools and tool errors are reported as text
    /// the model can read. String results are returned as-is, anything
    /// else as pretty-printed JSON.
    pub async fn execute(&self, name: &str, arguments: &str) -> String {
        let Some(tool) = self.find(name) else {
            return format!("Tool {} is not registered.", name);
        };

        match run_tool(tool, arguments).await {
            Ok(Value::String(text)) => text,
            Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
            Err(e) => format!("Error executing tool {}: {}", name, e),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_tool(tool: &dyn Tool, arguments: &str) -> Result<Value> {
    let params: Value = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(arguments)?
    };
    let params = validate_params(&tool.parameters_schema(), &params)?;
    debug!(tool = tool.name(), %params, "calling tool");
    let result = tool.execute(params).await?;
    debug!(tool = tool.name(), %result, "tool finished");
    Ok(result)
}

/// Check tool arguments against the tool's JSON Schema: they must form an
/// object holding every required key, with declared primitive types.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let args = match params {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => bail!("arguments must be a JSON object, got {}", type_of(other)),
    };

    let required = schema.get("required").and_then(Value::as_array);
    for field in required.into_iter().flatten().filter_map(Value::as_str) {
        if !args.contains_key(field) {
            bail!("missing required parameter: {}", field);
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    for (name, property) in properties.into_iter().flatten() {
        let expected = property.get("type").and_then(Value::as_str);
        let (Some(value), Some(expected)) = (args.get(name), expected) else {
            continue;
        };
        if !matches_type(value, expected) {
            bail!(
                "parameter '{}' must be of type '{}', got {}",
                name,
                expected,
                type_of(value)
            );
        }
    }

    Ok(Value::Object(args))
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============ get_context ============

/// Semantic search over the document collection.
pub struct GetContextTool {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    collection: String,
    default_limit: usize,
    max_limit: usize,
}

impl GetContextTool {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        default_limit: usize,
        max_limit: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            collection: collection.into(),
            default_limit,
            max_limit: max_limit.max(1),
        }
    }

    /// Requested limit clamped to `1..=max_limit`.
    fn effective_limit(&self, requested: Option<i64>) -> usize {
        match requested {
            Some(n) => (n.max(1) as usize).min(self.max_limit),
            None => self.default_limit.clamp(1, self.max_limit),
        }
    }
}

#[async_trait]
impl Tool for GetContextTool {
    fn name(&self) -> &str {
        "get_context"
    }

    fn description(&self) -> &str {
        "Use this tool to search for information in the vector store. \
         Query search expands user input with an hypothetical answer to increase cosine similarity."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "search_query": {
                    "type": "string",
                    "description": "Expanded sentence generated from user input to increase cosine similarity."
                },
                "limit": {
                    "type": "integer",
                    "description": "Max number of results to return, usually 3-5 are enough. \
                                    Keep it higher for abstractive queries, lower for extractive (factual) queries."
                }
            },
            "required": ["search_query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let query = params
            .get("search_query")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        let limit = self.effective_limit(params.get("limit").and_then(|l| l.as_i64()));

        let vector = embed_query(self.embedder.as_ref(), query).await?;
        let points = self.store.query(&self.collection, &vector, limit).await?;

        Ok(serde_json::to_value(points)?)
    }
}

// ============ math_reasoning ============

/// Sub-agent that writes out the procedure to reach a numeric result.
pub struct MathReasoningTool {
    model: Arc<dyn ChatModel>,
    temperature: f32,
}

impl MathReasoningTool {
    pub fn new(model: Arc<dyn ChatModel>, temperature: f32) -> Self {
        Self { model, temperature }
    }
}

#[async_trait]
impl Tool for MathReasoningTool {
    fn name(&self) -> &str {
        "math_reasoning"
    }

    fn description(&self) -> &str {
        "Use this tool to approach the problem using mathematical reasoning."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {
                    "type": "string",
                    "description": "The question to be answered."
                },
                "context": {
                    "type": "string",
                    "description": "Contextual information to help answer the question."
                }
            },
            "required": ["question", "context"]
        })
    }

    async fn execute(&self, params: Value) -> Result<Value> {
        let question = params
            .get("question")
            .and_then(|q| q.as_str())
            .unwrap_or_default();
        let context = params
            .get("context")
            .and_then(|c| c.as_str())
            .unwrap_or_default();

        let messages = [
            ChatMessage::system(math_reasoning_system_prompt(context)),
            ChatMessage::user(question),
        ];
        let options = CompletionOptions {
            temperature: self.temperature,
            tools_enabled: false,
        };
        let completion = self.model.complete(&messages, &[], &options).await?;
        Ok(Value::String(completion.message.content_str().to_string()))
    }
}
