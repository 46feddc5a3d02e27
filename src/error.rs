//! Typed errors for calls into hosted services (LLM, embeddings, OCR,
//! vector database).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{service} API error {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },

    #[error("{service} request failed: {source}")]
    Transport {
        service: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{0} environment variable not set")]
    MissingApiKey(&'static str),

    #[error("Invalid {service} response: {message}")]
    InvalidResponse { service: String, message: String },
}

impl ApiError {
    /// Rate limits, server errors and network failures are worth retrying;
    /// other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::Transport { .. } => true,
            ApiError::MissingApiKey(_) | ApiError::InvalidResponse { .. } => false,
        }
    }

    pub fn invalid_response(service: &str, message: impl Into<String>) -> Self {
        ApiError::InvalidResponse {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

/// Read an API key from the environment.
pub fn api_key(var: &'static str) -> Result<String, ApiError> {
    match std::env::var(var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(ApiError::MissingApiKey(var)),
    }
}
