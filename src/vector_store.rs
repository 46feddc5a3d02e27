//! Vector store abstraction.
//!
//! Two backends implement [`VectorStore`]:
//!
//! - **[`QdrantStore`]**: a Qdrant server over its REST API.
//! - **[`MemoryStore`]**: brute-force search over an in-process map,
//!   optionally persisted to a JSON file. Used for local runs and tests.
//!
//! Query results come back best match first. For `Cosine` and `Dot` that
//! is descending score; for `Euclid` the score is the distance and results
//! are ascending, which is what Qdrant does as well.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::config::VectorStoreConfig;
use crate::embedding::{cosine_similarity, dot_product, euclidean_distance};
use crate::error::ApiError;
use crate::http::{client_with_timeout, send_with_retry, JsonRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Distance {
    #[default]
    Cosine,
    Dot,
    Euclid,
}

impl Distance {
    fn score(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Distance::Cosine => cosine_similarity(a, b),
            Distance::Dot => dot_product(a, b),
            Distance::Euclid => euclidean_distance(a, b),
        }
    }

    fn higher_is_better(self) -> bool {
        !matches!(self, Distance::Euclid)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub id: u64,
    pub vector: Vec<f32>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: u64,
    pub score: f32,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn collection_exists(&self, name: &str) -> Result<bool>;

    async fn create_collection(&self, name: &str, dims: usize, distance: Distance) -> Result<()>;

    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Insert or replace points by id.
    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()>;

    /// The `limit` nearest points to `vector`, best match first.
    async fn query(&self, name: &str, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>>;
}

/// Stable point id for chunk `chunk_id` of document `document_id`.
///
/// Several documents can share a collection, and loading the same chunks
/// twice overwrites instead of duplicating.
pub fn point_id(document_id: &str, chunk_id: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_id.to_string().as_bytes());
    let digest = hasher.finalize();
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(raw)
}

/// Build the store selected by `config.backend`.
pub fn create_vector_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "qdrant" => Ok(Arc::new(QdrantStore::new(&config.url)?)),
        "memory" => Ok(Arc::new(MemoryStore::open(config.path.clone())?)),
        other => bail!("Unknown vector_store backend: {}", other),
    }
}

// ============ Qdrant ============

const QDRANT: &str = "Qdrant";

pub struct QdrantStore {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_retries: u32,
}

impl QdrantStore {
    /// Reads an optional `QDRANT_API_KEY` from the environment.
    pub fn new(url: &str) -> Result<Self> {
        let api_key = std::env::var("QDRANT_API_KEY").ok().filter(|k| !k.is_empty());
        Self::with_api_key(url, api_key)
    }

    pub fn with_api_key(url: &str, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: client_with_timeout(30)?,
            base_url: url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: 3,
        })
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{}", self.base_url, name)
    }

    async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Value> {
        let mut req = JsonRequest::new(QDRANT, method, url);
        req.body = body;
        if let Some(key) = &self.api_key {
            req = req.header("api-key", key);
        }
        Ok(send_with_retry(&self.client, &req, self.max_retries).await?)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let url = format!("{}/exists", self.collection_url(name));
        let json = self.call(Method::GET, &url, None).await?;
        json.pointer("/result/exists")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| ApiError::invalid_response(QDRANT, "missing result.exists").into())
    }

    async fn create_collection(&self, name: &str, dims: usize, distance: Distance) -> Result<()> {
        let body = json!({
            "vectors": { "size": dims, "distance": distance },
        });
        self.call(Method::PUT, &self.collection_url(name), Some(&body))
            .await
            .with_context(|| format!("Failed to create collection {}", name))?;
        info!(collection = name, dims, ?distance, "collection created");
        Ok(())
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.call(Method::DELETE, &self.collection_url(name), None)
            .await
            .with_context(|| format!("Failed to delete collection {}", name))?;
        info!(collection = name, "collection deleted");
        Ok(())
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        let count = points.len();
        let url = format!("{}/points?wait=true", self.collection_url(name));
        let body = json!({ "points": points });
        self.call(Method::PUT, &url, Some(&body))
            .await
            .with_context(|| format!("Failed to upsert into {}", name))?;
        debug!(collection = name, count, "points upserted");
        Ok(())
    }

    async fn query(&self, name: &str, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
        let url = format!("{}/points/query", self.collection_url(name));
        let body = json!({
            "query": vector,
            "limit": limit,
            "with_payload": true,
        });
        let json = self.call(Method::POST, &url, Some(&body)).await?;
        parse_query_response(&json)
    }
}

/// Parse `result.points` of a Qdrant query response.
pub fn parse_query_response(json: &Value) -> Result<Vec<ScoredPoint>> {
    let points = json
        .pointer("/result/points")
        .cloned()
        .ok_or_else(|| ApiError::invalid_response(QDRANT, "missing result.points"))?;
    serde_json::from_value(points)
        .map_err(|e| ApiError::invalid_response(QDRANT, e.to_string()).into())
}

// ============ In-memory ============

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Collection {
    dims: usize,
    distance: Distance,
    points: BTreeMap<u64, Point>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Collections {
    collections: HashMap<String, Collection>,
}

/// In-process vector store, optionally persisted to a JSON file.
pub struct MemoryStore {
    path: Option<PathBuf>,
    state: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            path: None,
            state: RwLock::new(Collections::default()),
        }
    }

    /// Open a store persisted at `path`, loading it if the file exists.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let state = match &path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read {}", p.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Invalid vector store file {}", p.display()))?
            }
            _ => Collections::default(),
        };
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Collections> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Collections> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &Collections) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json(path, state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn write_json(path: &Path, state: &Collections) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string(state)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn collection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.read().collections.contains_key(name))
    }

    async fn create_collection(&self, name: &str, dims: usize, distance: Distance) -> Result<()> {
        if dims == 0 {
            bail!("Collection dimension must be > 0");
        }
        let mut state = self.write();
        if state.collections.contains_key(name) {
            bail!("Collection {} already exists", name);
        }
        state.collections.insert(
            name.to_string(),
            Collection {
                dims,
                distance,
                points: BTreeMap::new(),
            },
        );
        self.persist(&state)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let mut state = self.write();
        state.collections.remove(name);
        self.persist(&state)
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        let mut state = self.write();
        let collection = state
            .collections
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("Collection {} not found", name))?;

        if let Some(bad) = points.iter().find(|p| p.vector.len() != collection.dims) {
            bail!(
                "Point {} has {} dimensions, collection {} expects {}",
                bad.id,
                bad.vector.len(),
                name,
                collection.dims
            );
        }
        for point in points {
            collection.points.insert(point.id, point);
        }
        self.persist(&state)
    }

    async fn query(&self, name: &str, vector: &[f32], limit: usize) -> Result<Vec<ScoredPoint>> {
        let state = self.read();
        let collection = state
            .collections
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Collection {} not found", name))?;
        if vector.len() != collection.dims {
            bail!(
                "Query has {} dimensions, collection {} expects {}",
                vector.len(),
                name,
                collection.dims
            );
        }

        let distance = collection.distance;
        let mut scored: Vec<ScoredPoint> = collection
            .points
            .values()
            .map(|p| ScoredPoint {
                id: p.id,
                score: distance.score(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        if distance.higher_is_better() {
            scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        } else {
            scored.sort_by(|a, b| a.score.total_cmp(&b.score));
        }
        scored.truncate(limit);
        Ok(scored)
    }
}
