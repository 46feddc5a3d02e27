//! # Agentic RAG
//!
//! Retrieval-augmented question answering over OCR'd documents.
//!
//! Documents (PDFs, scanned images) are run through Mistral OCR, split into
//! chunks, embedded and loaded into a vector store. A routing agent then
//! answers questions by letting an OpenAI-compatible chat model call two
//! tools: `get_context` (similarity search over the collection) and
//! `math_reasoning` (a sub-call that writes out numeric reasoning).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │   OCR    │──▶│  Chunk   │──▶│  Embed   │──▶│ Vector store │
//! │ Mistral  │   │ headers/ │   │ Jina/... │   │ Qdrant/memory│
//! └──────────┘   │ pages    │   └──────────┘   └──────┬───────┘
//!                └──────────┘                         │
//!                      ┌──────────────────────────────┤
//!                      ▼                              ▼
//!                ┌───────────┐    tool calls    ┌───────────┐
//!                │ CLI / WS  │─────────────────▶│   Agent   │
//!                │  server   │◀─────────────────│ chat loop │
//!                └───────────┘      events      └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! rag ingest ./docs --collection rules   # OCR, chunk, embed, load
//! rag ask "Quanti giocatori per squadra?"
//! rag serve                              # chat page on http://127.0.0.1:8000
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Typed errors of the hosted APIs |
//! | [`http`] | JSON requests with retry and backoff |
//! | [`rate_limit`] | Requests/tokens per minute budget |
//! | [`models`] | Chunks and conversation messages |
//! | [`ocr`] | Mistral OCR client and artifacts |
//! | [`chunk`] | Chunking strategies |
//! | [`embedding`] | Embedding providers |
//! | [`vector_store`] | Qdrant and in-memory stores |
//! | [`ingest`] | OCR → chunk → embed → load pipeline |
//! | [`llm`] | Chat completion client |
//! | [`prompts`] | System prompts |
//! | [`tools`] | Agent tools and registry |
//! | [`conversation`] | Routing loop and conversation state |
//! | [`server`] | HTTP/WebSocket chat server |
//! | [`evaluate`] | Batch question answering |

pub mod chunk;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod evaluate;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod models;
pub mod ocr;
pub mod prompts;
pub mod rate_limit;
pub mod server;
pub mod tools;
pub mod vector_store;
