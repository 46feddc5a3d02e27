//! Offline ingestion pipeline.
//!
//! Each stage reads the previous stage's artifact from `ocr.output_dir`
//! and writes its own, so stages can be rerun independently:
//!
//! | Stage | Input | Output |
//! |-------|-------|--------|
//! | ocr | PDF or image | `ocr_result_<id>.json`, `ocr_result_<id>.md` |
//! | chunk | OCR json or markdown | `chunked_<id>.json` |
//! | embed | chunks | `embeddings_<id>.json` |
//! | load | embeddings | points in the vector store |
//!
//! `<id>` is the document id: the Mistral file id for uploaded documents,
//! a content-derived UUID for images. Re-embedding a document reuses the
//! vectors of chunks whose hash did not change.

use anyhow::{bail, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunk::{chunk_document, ChunkStrategy};
use crate::config::Config;
use crate::embedding::{create_embedder, embed_batched, Embedder};
use crate::models::{Chunk, ChunkWithEmbedding};
use crate::ocr::{load_ocr_input, save_artifacts, MistralOcr, OcrArtifacts, OcrResponse};
use crate::vector_store::{create_vector_store, point_id, Distance, Point, VectorStore};

const DOCUMENT_GLOBS: [&str; 6] = [
    "**/*.pdf",
    "**/*.png",
    "**/*.jpg",
    "**/*.jpeg",
    "**/*.webp",
    "**/*.avif",
];

/// Output of the chunk stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkedDocument {
    pub document_id: String,
    pub filename: String,
    pub strategy: ChunkStrategy,
    pub chunks: Vec<Chunk>,
}

/// Output of the embed stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedDocument {
    pub document_id: String,
    pub filename: String,
    pub model: String,
    pub chunks: Vec<ChunkWithEmbedding>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestSummary {
    pub documents: usize,
    pub chunks: usize,
    pub embedded: usize,
    pub reused: usize,
    pub points: usize,
}

// ============ OCR ============

pub async fn run_ocr(config: &Config, file: &Path) -> Result<(String, OcrArtifacts)> {
    let ocr = MistralOcr::new(&config.ocr)?;
    let (document_id, response) = ocr.process_file(file).await?;
    let artifacts = save_artifacts(&config.ocr.output_dir, &document_id, &response)?;
    info!(
        file = %file.display(),
        %document_id,
        pages = response.pages.len(),
        "OCR finished"
    );
    Ok((document_id, artifacts))
}

// ============ Chunk ============

/// Document id of a stage input: `ocr_result_<id>.json` gives `<id>`,
/// anything else its file stem.
pub fn document_id_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    stem.strip_prefix("ocr_result_")
        .map(str::to_string)
        .unwrap_or(stem)
}

pub fn chunk_ocr(
    config: &Config,
    ocr: &OcrResponse,
    strategy: ChunkStrategy,
    document_id: &str,
    filename: &str,
) -> ChunkedDocument {
    let chunks = chunk_document(ocr, strategy, &config.chunking);
    ChunkedDocument {
        document_id: document_id.to_string(),
        filename: filename.to_string(),
        strategy,
        chunks,
    }
}

/// Chunk an OCR result or markdown file and write `chunked_<id>.json`.
pub fn run_chunk(config: &Config, input: &Path, strategy: Option<ChunkStrategy>) -> Result<PathBuf> {
    let ocr = load_ocr_input(input)?;
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let strategy = strategy.unwrap_or(config.chunking.strategy);
    let doc = chunk_ocr(config, &ocr, strategy, &document_id_from_path(input), &filename);
    write_chunks(config, &doc)
}

fn write_chunks(config: &Config, doc: &ChunkedDocument) -> Result<PathBuf> {
    let path = config
        .ocr
        .output_dir
        .join(format!("chunked_{}.json", doc.document_id));
    write_artifact(&path, doc)?;
    info!(
        document_id = %doc.document_id,
        chunks = doc.chunks.len(),
        strategy = ?doc.strategy,
        path = %path.display(),
        "chunks written"
    );
    Ok(path)
}

// ============ Embed ============

/// Embed the chunks of `doc`, reusing vectors from `previous` for chunks
/// whose hash is unchanged. Returns the document and the reuse count.
pub async fn embed_document(
    embedder: &dyn Embedder,
    doc: &ChunkedDocument,
    previous: Option<&EmbeddedDocument>,
    batch_size: usize,
) -> Result<(EmbeddedDocument, usize)> {
    let cache: HashMap<&str, &Vec<f32>> = previous
        .filter(|p| p.model == embedder.model_name())
        .map(|p| {
            p.chunks
                .iter()
                .filter(|c| !c.hash.is_empty())
                .map(|c| (c.hash.as_str(), &c.embedding))
                .collect()
        })
        .unwrap_or_default();

    let missing: Vec<&Chunk> = doc
        .chunks
        .iter()
        .filter(|c| !cache.contains_key(c.hash.as_str()))
        .collect();
    let texts: Vec<String> = missing.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_batched(embedder, &texts, batch_size).await?;
    if vectors.len() != missing.len() {
        bail!(
            "Expected {} embeddings, got {}",
            missing.len(),
            vectors.len()
        );
    }
    let fresh: HashMap<u64, Vec<f32>> = missing.iter().map(|c| c.id).zip(vectors).collect();

    let mut reused = 0;
    let mut chunks = Vec::with_capacity(doc.chunks.len());
    for chunk in &doc.chunks {
        let embedding = match fresh.get(&chunk.id) {
            Some(v) => v.clone(),
            None => {
                reused += 1;
                cache
                    .get(chunk.hash.as_str())
                    .map(|v| (*v).clone())
                    .unwrap_or_default()
            }
        };
        chunks.push(ChunkWithEmbedding::new(chunk, embedding));
    }

    Ok((
        EmbeddedDocument {
            document_id: doc.document_id.clone(),
            filename: doc.filename.clone(),
            model: embedder.model_name().to_string(),
            chunks,
        },
        reused,
    ))
}

fn embeddings_path(config: &Config, document_id: &str) -> PathBuf {
    config
        .ocr
        .output_dir
        .join(format!("embeddings_{}.json", document_id))
}

async fn embed_to_file(
    config: &Config,
    embedder: &dyn Embedder,
    doc: &ChunkedDocument,
    batch_size: usize,
) -> Result<(PathBuf, EmbeddedDocument, usize)> {
    let path = embeddings_path(config, &doc.document_id);
    let previous: Option<EmbeddedDocument> = if path.exists() {
        match read_artifact(&path) {
            Ok(prev) => Some(prev),
            Err(e) => {
                warn!(path = %path.display(), "ignoring unreadable embeddings cache: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let (embedded, reused) = embed_document(embedder, doc, previous.as_ref(), batch_size).await?;
    write_artifact(&path, &embedded)?;
    info!(
        document_id = %doc.document_id,
        chunks = embedded.chunks.len(),
        reused,
        tokens = embedder.tokens_used(),
        path = %path.display(),
        "embeddings written"
    );
    Ok((path, embedded, reused))
}

/// Embed a `chunked_<id>.json` file and write `embeddings_<id>.json`.
pub async fn run_embed(config: &Config, input: &Path, batch_size: Option<usize>) -> Result<PathBuf> {
    let doc: ChunkedDocument = read_artifact(input)?;
    let embedder = create_embedder(&config.embedding)?;
    let batch_size = batch_size.unwrap_or(config.embedding.batch_size);
    let (path, _, _) = embed_to_file(config, embedder.as_ref(), &doc, batch_size).await?;
    Ok(path)
}

// ============ Load ============

/// Upsert the chunks of `doc` into `collection`, creating it with the
/// dimension of the first vector when it does not exist.
pub async fn load_document(
    store: &dyn VectorStore,
    collection: &str,
    doc: &EmbeddedDocument,
    distance: Distance,
) -> Result<usize> {
    let Some(first) = doc.chunks.first() else {
        warn!(document_id = %doc.document_id, "no chunks to load");
        return Ok(0);
    };

    if !store.collection_exists(collection).await? {
        store
            .create_collection(collection, first.embedding.len(), distance)
            .await?;
    }

    let points: Vec<Point> = doc
        .chunks
        .iter()
        .map(|chunk| {
            let mut payload = Map::new();
            payload.insert("text".to_string(), json!(chunk.text));
            payload.insert("filename".to_string(), json!(doc.filename));
            payload.insert("document_id".to_string(), json!(doc.document_id));
            payload.insert("chunk_id".to_string(), json!(chunk.id));
            Point {
                id: point_id(&doc.document_id, chunk.id),
                vector: chunk.embedding.clone(),
                payload,
            }
        })
        .collect();

    let count = points.len();
    store.upsert(collection, points).await?;
    info!(collection, document_id = %doc.document_id, points = count, "points loaded");
    Ok(count)
}

fn resolve_collection(config: &Config, explicit: Option<&str>, document_id: &str) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| config.vector_store.collection.clone())
        .unwrap_or_else(|| document_id.to_string())
}

/// Load an `embeddings_<id>.json` file into the vector store.
pub async fn run_load(config: &Config, input: &Path, collection: Option<&str>) -> Result<usize> {
    let doc: EmbeddedDocument = read_artifact(input)?;
    let store = create_vector_store(&config.vector_store)?;
    let collection = resolve_collection(config, collection, &doc.document_id);
    load_document(
        store.as_ref(),
        &collection,
        &doc,
        config.vector_store.distance,
    )
    .await
}

pub async fn create_collection(config: &Config, name: &str, dims: usize) -> Result<()> {
    let store = create_vector_store(&config.vector_store)?;
    if store.collection_exists(name).await? {
        bail!("Collection {} already exists", name);
    }
    store
        .create_collection(name, dims, config.vector_store.distance)
        .await
}

pub async fn delete_collection(config: &Config, name: &str) -> Result<()> {
    let store = create_vector_store(&config.vector_store)?;
    store.delete_collection(name).await
}

// ============ Full pipeline ============

/// Documents to ingest under `path`: the file itself, or every PDF and
/// image below a directory, sorted.
pub fn find_documents(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        bail!("{} does not exist", path.display());
    }

    let globs = build_globset(&DOCUMENT_GLOBS)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(path) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(path).unwrap_or(entry.path());
        if globs.is_match(relative) {
            files.push(entry.path().to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

/// OCR, chunk, embed and load every document under `path`.
pub async fn run_ingest(
    config: &Config,
    path: &Path,
    collection: Option<&str>,
    strategy: Option<ChunkStrategy>,
    recreate: bool,
) -> Result<IngestSummary> {
    let files = find_documents(path)?;
    if files.is_empty() {
        bail!("No PDF or image files found under {}", path.display());
    }

    let ocr = MistralOcr::new(&config.ocr)?;
    let embedder = create_embedder(&config.embedding)?;
    let store = create_vector_store(&config.vector_store)?;
    let strategy = strategy.unwrap_or(config.chunking.strategy);

    let mut summary = IngestSummary::default();
    let mut recreated: HashSet<String> = HashSet::new();

    for file in &files {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        info!(file = %file.display(), "ingesting");

        let (document_id, response) = ocr
            .process_file(file)
            .await
            .with_context(|| format!("OCR failed for {}", file.display()))?;
        save_artifacts(&config.ocr.output_dir, &document_id, &response)?;

        let chunked = chunk_ocr(config, &response, strategy, &document_id, &filename);
        write_chunks(config, &chunked)?;

        let (_, embedded, reused) = embed_to_file(
            config,
            embedder.as_ref(),
            &chunked,
            config.embedding.batch_size,
        )
        .await?;

        let target = resolve_collection(config, collection, &document_id);
        if recreate && recreated.insert(target.clone()) && store.collection_exists(&target).await? {
            store.delete_collection(&target).await?;
        }
        let points = load_document(
            store.as_ref(),
            &target,
            &embedded,
            config.vector_store.distance,
        )
        .await?;

        summary.documents += 1;
        summary.chunks += chunked.chunks.len();
        summary.embedded += chunked.chunks.len() - reused;
        summary.reused += reused;
        summary.points += points;

        println!("{} -> {} ({} chunks)", filename, target, chunked.chunks.len());
    }

    println!("ingest");
    println!("  documents: {}", summary.documents);
    println!("  chunks: {}", summary.chunks);
    println!("  embedded: {}", summary.embedded);
    println!("  reused embeddings: {}", summary.reused);
    println!("  points loaded: {}", summary.points);
    println!("  embedding tokens: {}", embedder.tokens_used());
    println!("ok");

    Ok(summary)
}

// ============ Artifacts ============

fn write_artifact<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, serde_json::to_string_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn read_artifact<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid artifact {}", path.display()))
}
