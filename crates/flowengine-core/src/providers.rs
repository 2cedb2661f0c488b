// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! The abstract language-model handle (spec §4.1, "LanguageModel"). Concrete
//! implementations (Anthropic, OpenAI, ...) live in the `flowengine-providers` crate
//! and are registered into a run by name.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A chat/completion-capable model, optionally also capable of embeddings for
/// `memory` steps.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Embeds `text` into a dense vector. Providers that don't support embeddings
    /// should return [`ProviderError::InvalidRequest`].
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let _ = text;
        Err(ProviderError::InvalidRequest(format!(
            "{} does not support embeddings",
            self.name()
        )))
    }

    fn name(&self) -> &str;

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Tool schemas offered to the model for this call, when the step declares
    /// `tools`/`mcp_servers`.
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    pub model: String,
    pub tokens_used: Option<u32>,
    /// Tool calls the model asked to make; empty unless the step registered tools.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(flatten)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),
    #[error("Authentication failed: {0}")]
    AuthError(String),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Provider error: {0}")]
    ProviderSpecific(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Request timed out")]
    Timeout,
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}
