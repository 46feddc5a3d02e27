//! Core data models shared by the ingestion pipeline and the agent.
//!
//! Chunks flow from the chunker through the embedder into the vector
//! store; input/output messages wrap one user turn of a conversation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chunk of OCR'd document text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: u64,
    pub text: String,
    /// SHA-256 of `text`, used to reuse embeddings of unchanged chunks.
    #[serde(default)]
    pub hash: String,
}

/// A chunk together with its embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkWithEmbedding {
    pub id: u64,
    pub text: String,
    #[serde(default)]
    pub hash: String,
    pub embedding: Vec<f32>,
}

impl ChunkWithEmbedding {
    pub fn new(chunk: &Chunk, embedding: Vec<f32>) -> Self {
        Self {
            id: chunk.id,
            text: chunk.text.clone(),
            hash: chunk.hash.clone(),
            embedding,
        }
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// One user turn received from a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputMessage {
    #[serde(default = "new_correlation_id")]
    pub correlation_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl InputMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: new_correlation_id(),
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The assistant's answer to an [`InputMessage`].
///
/// `correlation_id` and `conversation_id` are copied from the input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMessage {
    pub correlation_id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputMessage {
    pub fn reply_to(input: &InputMessage, message: impl Into<String>) -> Self {
        Self {
            correlation_id: input.correlation_id.clone(),
            conversation_id: input.conversation_id.clone(),
            user_id: input.user_id.clone(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}
