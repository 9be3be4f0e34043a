//! Language-model call contract.
//!
//! The workflow core only depends on [`LlmClient`]; vendor request/response
//! shapes stay inside the client implementations.

mod gemini;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use gemini::{GeminiClient, GeminiClientConfig};

/// Generation parameters forwarded with every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: Some(2048),
            top_p: None,
        }
    }
}

/// LLM request payload
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub generation: GenerationParams,
}

/// LLM client trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Cheap local check that the client can issue calls at all
    fn ensure_ready(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError>;
}

#[async_trait]
impl LlmClient for Arc<dyn LlmClient> {
    fn ensure_ready(&self) -> Result<(), LlmError> {
        (**self).ensure_ready()
    }

    async fn complete(&self, request: LlmRequest) -> Result<String, LlmError> {
        (**self).complete(request).await
    }
}

/// LLM errors
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("API key is not configured")]
    MissingCredential,
    #[error("http error: {0}")]
    Http(String),
    #[error("response error: {0}")]
    Response(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("model returned an empty response")]
    EmptyResponse,
}
