//! Mistral OCR client and OCR artifacts.
//!
//! PDFs and other documents are uploaded to the Mistral files API and
//! processed through a signed URL; images are sent inline as base64 data
//! URLs. The OCR response keeps one markdown string per page, which is
//! what the chunkers consume.

use anyhow::{Context, Result};
use base64::Engine;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::OcrConfig;
use crate::error::{api_key, ApiError};
use crate::http::{client_with_timeout, retry, send_request, send_with_retry, JsonRequest};

const SERVICE: &str = "Mistral OCR";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrPage {
    pub index: usize,
    pub markdown: String,
    #[serde(default)]
    pub images: Vec<Value>,
    #[serde(default)]
    pub dimensions: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResponse {
    pub pages: Vec<OcrPage>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage_info: Option<Value>,
}

impl OcrResponse {
    /// Build a single-page response from plain markdown (used when the
    /// chunker is fed a `.md` file instead of an OCR result).
    pub fn from_markdown(markdown: &str) -> Self {
        Self {
            pages: vec![OcrPage {
                index: 0,
                markdown: markdown.to_string(),
                images: Vec::new(),
                dimensions: None,
            }],
            model: String::new(),
            usage_info: None,
        }
    }
}

/// Document reference accepted by the OCR endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum OcrDocument {
    DocumentUrl(String),
    ImageUrl(String),
}

impl OcrDocument {
    fn to_json(&self) -> Value {
        match self {
            OcrDocument::DocumentUrl(url) => json!({
                "type": "document_url",
                "document_url": url,
            }),
            OcrDocument::ImageUrl(url) => json!({
                "type": "image_url",
                "image_url": url,
            }),
        }
    }
}

pub struct MistralOcr {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl MistralOcr {
    /// Requires `MISTRAL_API_KEY` in the environment.
    pub fn new(config: &OcrConfig) -> Result<Self> {
        Self::with_api_key(config, api_key("MISTRAL_API_KEY")?)
    }

    pub fn with_api_key(config: &OcrConfig, api_key: String) -> Result<Self> {
        Ok(Self {
            client: client_with_timeout(config.timeout_secs)?,
            base_url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }

    /// Upload a file for OCR and return its file id.
    pub async fn upload(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());

        let url = format!("{}/v1/files", self.base_url);
        let json = retry(SERVICE, self.max_retries, || {
            let form = reqwest::multipart::Form::new()
                .text("purpose", "ocr")
                .part(
                    "file",
                    reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone()),
                );
            let builder = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .multipart(form);
            send_request(SERVICE, builder)
        })
        .await?;

        let id = json
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApiError::invalid_response(SERVICE, "upload response has no id"))?;
        Ok(id.to_string())
    }

    /// Get a temporary download URL for an uploaded file.
    pub async fn signed_url(&self, file_id: &str) -> Result<String> {
        let url = format!("{}/v1/files/{}/url?expiry=24", self.base_url, file_id);
        let req = JsonRequest::new(SERVICE, Method::GET, &url).bearer(&self.api_key);
        let json = send_with_retry(&self.client, &req, self.max_retries).await?;
        let signed = json
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ApiError::invalid_response(SERVICE, "signed url response has no url"))?;
        Ok(signed.to_string())
    }

    pub async fn process(&self, document: &OcrDocument) -> Result<OcrResponse> {
        let url = format!("{}/v1/ocr", self.base_url);
        let body = json!({
            "model": self.model,
            "document": document.to_json(),
            "include_image_base64": false,
        });
        let req = JsonRequest::post(SERVICE, &url, &body).bearer(&self.api_key);
        let json = send_with_retry(&self.client, &req, self.max_retries).await?;
        serde_json::from_value(json)
            .map_err(|e| ApiError::invalid_response(SERVICE, e.to_string()).into())
    }

    /// OCR a local file, returning its document id and the OCR result.
    pub async fn process_file(&self, path: &Path) -> Result<(String, OcrResponse)> {
        if let Some(mime) = image_mime(path) {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let document_id = content_document_id(&bytes);
            info!(file = %path.display(), %document_id, "sending image inline for OCR");
            let document = OcrDocument::ImageUrl(data_url(mime, &bytes));
            let response = self.process(&document).await?;
            return Ok((document_id, response));
        }

        let file_id = self.upload(path).await?;
        info!(file = %path.display(), %file_id, "file uploaded");
        let signed = self.signed_url(&file_id).await?;
        debug!(%file_id, "obtained signed url");
        let response = self
            .process(&OcrDocument::DocumentUrl(signed))
            .await
            .with_context(|| format!("Error processing OCR for file with id {}", file_id))?;
        Ok((file_id, response))
    }
}

fn image_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "avif" => Some("image/avif"),
        _ => None,
    }
}

fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime,
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Derive a stable UUID from file content.
pub fn content_document_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(raw).to_string()
}

/// Concatenate the markdown of all pages, separated by blank lines.
pub fn combined_markdown(response: &OcrResponse) -> String {
    response
        .pages
        .iter()
        .map(|p| p.markdown.trim_end())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Paths of the files written by [`save_artifacts`].
#[derive(Debug, Clone)]
pub struct OcrArtifacts {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// Store the raw OCR response and its combined markdown.
pub fn save_artifacts(
    output_dir: &Path,
    document_id: &str,
    response: &OcrResponse,
) -> Result<OcrArtifacts> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let json_path = output_dir.join(format!("ocr_result_{}.json", document_id));
    std::fs::write(&json_path, serde_json::to_string_pretty(response)?)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;

    let md_path = output_dir.join(format!("ocr_result_{}.md", document_id));
    std::fs::write(&md_path, combined_markdown(response))
        .with_context(|| format!("Failed to write {}", md_path.display()))?;

    Ok(OcrArtifacts {
        json: json_path,
        markdown: md_path,
    })
}

/// Load an OCR result saved by [`save_artifacts`], or wrap a markdown file
/// as a single page.
pub fn load_ocr_input(path: &Path) -> Result<OcrResponse> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let is_json = path
        .extension()
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("{} is not an OCR result", path.display()))
    } else {
        Ok(OcrResponse::from_markdown(&content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r###"{
        "pages": [
            {"index": 0, "markdown": "# Title\n\nIntro text.\n", "images": [], "dimensions": {"dpi": 200, "height": 2200, "width": 1700}},
            {"index": 1, "markdown": "## Section\n\nMore text.", "images": []}
        ],
        "model": "mistral-ocr-2503-completion",
        "usage_info": {"pages_processed": 2, "doc_size_bytes": 1234}
    }"###;

    #[test]
    fn test_parse_ocr_response() {
        let response: OcrResponse = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(response.pages.len(), 2);
        assert_eq!(response.pages[1].index, 1);
        assert!(response.pages[1].dimensions.is_none());
    }

    #[test]
    fn test_combined_markdown() {
        let response: OcrResponse = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(
            combined_markdown(&response),
            "# Title\n\nIntro text.\n\n## Section\n\nMore text."
        );
    }

    #[test]
    fn test_image_detection() {
        assert_eq!(image_mime(Path::new("scan.PNG")), Some("image/png"));
        assert_eq!(image_mime(Path::new("photo.jpeg")), Some("image/jpeg"));
        assert_eq!(image_mime(Path::new("report.pdf")), None);
        assert_eq!(image_mime(Path::new("noext")), None);
    }

    #[test]
    fn test_data_url() {
        assert_eq!(data_url("image/png", b"abc"), "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_content_document_id_is_stable() {
        let a = content_document_id(b"same bytes");
        let b = content_document_id(b"same bytes");
        let c = content_document_id(b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(Uuid::parse_str(&a).is_ok());
    }

    #[test]
    fn test_document_json() {
        let doc = OcrDocument::DocumentUrl("https://files/x".to_string());
        assert_eq!(doc.to_json()["type"], "document_url");
        assert_eq!(doc.to_json()["document_url"], "https://files/x");
    }

    #[tokio::test]
    async fn test_upload_retried_on_server_error() {
        use axum::http::{HeaderMap, StatusCode};
        use axum::routing::post;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = axum::Router::new().route(
            "/v1/files",
            post(move |headers: HeaderMap, body: String| {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let multipart = headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("multipart/form-data"));
                    if !multipart || !body.contains("%PDF-1.4") || !body.contains("ocr") {
                        return (StatusCode::BAD_REQUEST, r#"{"error": "bad upload"}"#);
                    }
                    if n == 0 {
                        (StatusCode::SERVICE_UNAVAILABLE, r#"{"error": "busy"}"#)
                    } else {
                        (StatusCode::OK, r#"{"id": "file-1", "purpose": "ocr"}"#)
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let tmp = TempDir::new().unwrap();
        let pdf = tmp.path().join("regolamento.pdf");
        std::fs::write(&pdf, "%PDF-1.4 fake").unwrap();
        let config = OcrConfig {
            url: format!("http://{}", addr),
            max_retries: 2,
            ..OcrConfig::default()
        };
        let ocr = MistralOcr::with_api_key(&config, "test-key".to_string()).unwrap();

        assert_eq!(ocr.upload(&pdf).await.unwrap(), "file-1");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_save_and_load_artifacts() {
        let tmp = TempDir::new().unwrap();
        let response: OcrResponse = serde_json::from_str(SAMPLE).unwrap();
        let artifacts = save_artifacts(tmp.path(), "doc-1", &response).unwrap();
        assert!(artifacts.json.ends_with("ocr_result_doc-1.json"));

        let loaded = load_ocr_input(&artifacts.json).unwrap();
        assert_eq!(loaded.pages.len(), 2);

        let from_md = load_ocr_input(&artifacts.markdown).unwrap();
        assert_eq!(from_md.pages.len(), 1);
        assert!(from_md.pages[0].markdown.contains("## Section"));
    }
}
