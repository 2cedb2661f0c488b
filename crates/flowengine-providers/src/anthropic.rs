// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Anthropic (Claude) `LanguageModel` implementation.

use crate::traits::{CompletionRequest, CompletionResponse, LanguageModel, ProviderError, ToolCall, ToolSchema};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anthropic API model handle.
pub struct AnthropicModel {
    client: Client,
    api_key: String,
    base_url: String,
    api_version: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    #[serde(rename = "type")]
    #[allow(dead_code)]
    response_type: String,
    #[allow(dead_code)]
    role: String,
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicModel {
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else if let Some(status) = err.status() {
            if status == 401 || status == 403 {
                ProviderError::AuthError(err.to_string())
            } else if status == 429 {
                ProviderError::RateLimitExceeded
            } else {
                ProviderError::HttpError(err.to_string())
            }
        } else {
            ProviderError::HttpError(err.to_string())
        }
    }

    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com/v1".to_string(), "2023-06-01".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");

        Self { client, api_key, base_url, api_version }
    }

    /// Reads the API key from `ANTHROPIC_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::InvalidRequest("ANTHROPIC_API_KEY environment variable not set".to_string()))?;
        Ok(Self::new(api_key))
    }

    fn to_anthropic_request(&self, request: &CompletionRequest) -> MessagesRequest {
        let messages = vec![Message { role: "user".to_string(), content: request.prompt.clone() }];
        let tools = request
            .tools
            .iter()
            .map(|t: &ToolSchema| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens.unwrap_or(1024),
            system: request.system.clone(),
            temperature: request.temperature,
            tools,
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = error_response.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return ProviderError::RateLimitExceeded;
            }
            if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || error.error_type == "authentication_error"
                || error.error_type == "permission_error"
            {
                return ProviderError::AuthError(error.message);
            }
            if error.error_type == "invalid_request_error" {
                return ProviderError::InvalidRequest(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.error_type, error.message));
        }
        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let anthropic_request = self.to_anthropic_request(&request);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| String::from("failed to read response body"));

        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall { id, name, arguments: input }),
                ContentBlock::Unknown => {}
            }
        }

        let mut metadata = std::collections::HashMap::new();
        metadata.insert(
            "usage".to_string(),
            serde_json::json!({
                "input_tokens": parsed.usage.input_tokens,
                "output_tokens": parsed.usage.output_tokens,
                "total_tokens": parsed.usage.input_tokens + parsed.usage.output_tokens,
            }),
        );
        if let Some(stop_reason) = &parsed.stop_reason {
            metadata.insert("stop_reason".to_string(), serde_json::json!(stop_reason));
        }
        metadata.insert("id".to_string(), serde_json::json!(parsed.id));

        Ok(CompletionResponse {
            text,
            model: parsed.model,
            tokens_used: Some(parsed.usage.input_tokens + parsed.usage.output_tokens),
            tool_calls,
            metadata,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let test_request = CompletionRequest {
            model: "claude-3-haiku-20240307".to_string(),
            prompt: "Hi".to_string(),
            system: None,
            temperature: None,
            max_tokens: Some(5),
            tools: vec![],
            extra: std::collections::HashMap::new(),
        };
        self.complete(test_request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_creation() {
        let model = AnthropicModel::new("test-key".to_string());
        assert_eq!(model.name(), "anthropic");
        assert_eq!(model.base_url, "https://api.anthropic.com/v1");
    }

    #[test]
    fn custom_base_url() {
        let model = AnthropicModel::with_base_url(
            "test-key".to_string(),
            "http://localhost:8080".to_string(),
            "2023-06-01".to_string(),
        );
        assert_eq!(model.base_url, "http://localhost:8080");
        assert_eq!(model.api_version, "2023-06-01");
    }

    #[test]
    fn to_anthropic_request_carries_tools() {
        let model = AnthropicModel::new("test-key".to_string());
        let request = CompletionRequest {
            model: "claude-3-opus-20240229".to_string(),
            prompt: "Hello, world!".to_string(),
            system: Some("You are a helpful assistant".to_string()),
            temperature: Some(0.7),
            max_tokens: Some(100),
            tools: vec![ToolSchema {
                name: "search".to_string(),
                description: "search the web".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            extra: std::collections::HashMap::new(),
        };
        let req = model.to_anthropic_request(&request);
        assert_eq!(req.messages[0].content, "Hello, world!");
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.tools[0].name, "search");
    }

    #[test]
    fn parses_rate_limit_error() {
        let model = AnthropicModel::new("test-key".to_string());
        let body = r#"{"error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let error = model.parse_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(error, ProviderError::RateLimitExceeded));
    }

    #[test]
    fn parses_auth_error() {
        let model = AnthropicModel::new("test-key".to_string());
        let body = r#"{"error":{"type":"authentication_error","message":"bad key"}}"#;
        let error = model.parse_error(StatusCode::UNAUTHORIZED, body);
        match error {
            ProviderError::AuthError(msg) => assert_eq!(msg, "bad key"),
            _ => panic!("expected AuthError"),
        }
    }
}
