#![allow(dead_code)]

use agentic_rag::embedding::Embedder;
use agentic_rag::llm::{
    ChatCompletion, ChatMessage, ChatModel, CompletionOptions, ToolCall, ToolDefinition, Usage,
};
use agentic_rag::vector_store::{Distance, MemoryStore, Point, VectorStore};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Chat model that replays canned replies and records what it was sent.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ChatMessage>>,
    pub calls: Mutex<Vec<(Vec<ChatMessage>, CompletionOptions)>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ChatMessage>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn call(&self, i: usize) -> (Vec<ChatMessage>, CompletionOptions) {
        self.calls.lock().unwrap()[i].clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<ChatCompletion> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), *options));
        let message = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))?;
        Ok(ChatCompletion {
            message,
            finish_reason: None,
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

pub fn tool_call_reply(calls: &[(&str, &str, &str)]) -> ChatMessage {
    let mut msg = ChatMessage::assistant("");
    msg.content = None;
    msg.tool_calls = calls
        .iter()
        .map(|(id, name, args)| ToolCall::new(*id, *name, *args))
        .collect();
    msg
}

/// Maps text onto two axes: mentions of players vs. mentions of time.
pub struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    fn dims(&self) -> Option<usize> {
        Some(2)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let t = t.to_lowercase();
                let players = if t.contains("giocator") || t.contains("player") { 1.0 } else { 0.0 };
                let time = if t.contains("minut") || t.contains("tempo") { 1.0 } else { 0.0 };
                vec![players + 0.01, time + 0.01]
            })
            .collect())
    }
}

/// In-memory collection `rules` with two passages.
pub async fn rules_store() -> MemoryStore {
    let store = MemoryStore::new();
    store
        .create_collection("rules", 2, Distance::Cosine)
        .await
        .unwrap();

    let passages = [
        (1u64, "Art. 3: ogni squadra schiera 5 giocatori.", [1.0, 0.0]),
        (2u64, "Art. 7: una partita dura due tempi da 20 minuti.", [0.0, 1.0]),
    ];
    let points = passages
        .iter()
        .map(|(id, text, vector)| {
            let mut payload = Map::new();
            payload.insert("text".to_string(), json!(text));
            payload.insert("filename".to_string(), json!("regolamento.pdf"));
            Point {
                id: *id,
                vector: vector.to_vec(),
                payload,
            }
        })
        .collect();
    store.upsert("rules", points).await.unwrap();
    store
}
