// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Secrets input for a flowengine run.
//!
//! A run takes its secrets as a single `serde_json::Value` object (`Runner::run`'s
//! `secrets` argument, redacted from logs and step output via `flowengine_core::redact`).
//! This crate supplies that object from wherever the operator keeps secrets at rest --
//! today that's environment variables and local secrets files; a `SecretsProvider`
//! backed by a remote vault is a drop-in addition later, not a redesign.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("failed to read secrets file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("failed to parse secrets file {path}: {source}")]
    Parse { path: String, #[source] source: serde_json::Error },
}

/// Resolves the secrets object passed into a run.
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn load(&self) -> Result<Value, SecretsError>;
}

/// Collects every environment variable carrying a given prefix (stripped from the
/// resulting keys) into a flat JSON object, e.g. `FLOW_SECRET_API_KEY=x` with prefix
/// `FLOW_SECRET_` becomes `{"API_KEY": "x"}`.
pub struct EnvSecretsProvider {
    prefix: String,
}

impl EnvSecretsProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }
}

#[async_trait]
impl SecretsProvider for EnvSecretsProvider {
    async fn load(&self) -> Result<Value, SecretsError> {
        let mut secrets = serde_json::Map::new();
        for (key, value) in std::env::vars() {
            if let Some(stripped) = key.strip_prefix(&self.prefix) {
                secrets.insert(stripped.to_string(), Value::String(value));
            }
        }
        Ok(Value::Object(secrets))
    }
}

/// Reads a flat or nested secrets object out of a JSON file on disk.
pub struct JsonFileSecretsProvider {
    path: std::path::PathBuf,
}

impl JsonFileSecretsProvider {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl SecretsProvider for JsonFileSecretsProvider {
    async fn load(&self) -> Result<Value, SecretsError> {
        let path = self.path.to_string_lossy().to_string();
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SecretsError::Io { path: path.clone(), source })?;
        serde_json::from_str(&contents).map_err(|source| SecretsError::Parse { path, source })
    }
}

/// Merges several providers' outputs into one secrets object, later providers
/// overriding earlier ones on key collision -- useful for layering a file of
/// defaults under environment overrides at deploy time.
pub async fn merge_providers(providers: &[Box<dyn SecretsProvider>]) -> Result<Value, SecretsError> {
    let mut merged = HashMap::new();
    for provider in providers {
        if let Value::Object(map) = provider.load().await? {
            merged.extend(map);
        }
    }
    Ok(Value::Object(merged.into_iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn env_provider_strips_prefix() {
        std::env::set_var("FLOWTEST_SECRET_TOKEN", "abc123");
        let provider = EnvSecretsProvider::new("FLOWTEST_SECRET_");
        let secrets = provider.load().await.unwrap();
        assert_eq!(secrets["TOKEN"], Value::String("abc123".to_string()));
        std::env::remove_var("FLOWTEST_SECRET_TOKEN");
    }

    #[tokio::test]
    async fn json_file_provider_reads_object() {
        let dir = std::env::temp_dir().join(format!("flowengine-secrets-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("secrets.json");
        tokio::fs::write(&path, r#"{"api_key": "xyz"}"#).await.unwrap();

        let provider = JsonFileSecretsProvider::new(&path);
        let secrets = provider.load().await.unwrap();
        assert_eq!(secrets["api_key"], Value::String("xyz".to_string()));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
