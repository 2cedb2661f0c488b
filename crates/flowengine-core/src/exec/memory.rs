// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `memory` step execution: embeds `text` and either stores it or searches for its
//! nearest neighbors against a [`MemoryBackend`] (spec §4.1/§4.7).

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::{StepExecOutcome, StepOutcome};
use crate::error::EngineError;
use crate::providers::LanguageModel;
use crate::workflow::{MemoryOp, MemoryStepConfig};

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub metadata: Value,
}

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn store(&self, text: &str, embedding: Vec<f32>, metadata: Value) -> Result<String, EngineError>;
    async fn search(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<MemoryHit>, EngineError>;
}

pub async fn execute(
    step_id: &str,
    config: &MemoryStepConfig,
    model: &dyn LanguageModel,
    backend: &dyn MemoryBackend,
) -> Result<StepExecOutcome, EngineError> {
    let embedding = model
        .embed(&config.text)
        .await
        .map_err(|e| EngineError::step_execution(step_id, e.to_string()))?;

    let output = match config.op {
        MemoryOp::Store => {
            let id = backend.store(&config.text, embedding, config.metadata.clone()).await?;
            serde_json::json!({ "id": id })
        }
        MemoryOp::Search => {
            let hits = backend.search(embedding, config.top_k).await?;
            serde_json::to_value(hits)?
        }
    };
    Ok(StepExecOutcome::Completed(StepOutcome::simple(output)))
}

/// A process-local, non-persistent backend: linear cosine-similarity scan. Useful for
/// tests and for runs with `state-persistence` disabled; the durable backend lives in
/// `flowengine-state`.
///
/// Entries are bucketed by embedding dimension rather than kept in one flat table: a
/// workflow that switches embedding models mid-run (or runs two `memory` steps against
/// different models) would otherwise feed mismatched-length vectors into
/// `cosine_similarity`. Each dimension gets its own table instead (spec §4.7: "on
/// mismatch create/use a dimension-suffixed table"), and a search only ever scans the
/// table matching its own query vector's dimension.
#[derive(Default)]
pub struct InMemoryBackend {
    tables: parking_lot::Mutex<std::collections::HashMap<usize, Vec<(String, Vec<f32>, String, Value)>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn store(&self, text: &str, embedding: Vec<f32>, metadata: Value) -> Result<String, EngineError> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .to_string();
        let dimension = embedding.len();
        self.tables
            .lock()
            .entry(dimension)
            .or_default()
            .push((id.clone(), embedding, text.to_string(), metadata));
        Ok(id)
    }

    async fn search(&self, embedding: Vec<f32>, top_k: usize) -> Result<Vec<MemoryHit>, EngineError> {
        let dimension = embedding.len();
        let tables = self.tables.lock();
        let Some(entries) = tables.get(&dimension) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<MemoryHit> = entries
            .iter()
            .map(|(id, vec, text, metadata)| MemoryHit {
                id: id.clone(),
                text: text.clone(),
                score: cosine_similarity(&embedding, vec),
                metadata: metadata.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CompletionRequest, CompletionResponse, ProviderError};
    use async_trait::async_trait as async_trait_alias;
    use serde_json::json;

    struct FakeEmbedder;

    #[async_trait_alias]
    impl LanguageModel for FakeEmbedder {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            unimplemented!()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            // deterministic toy embedding: char-code histogram over 4 buckets
            let mut v = vec![0.0f32; 4];
            for (i, c) in text.chars().enumerate() {
                v[i % 4] += c as u32 as f32;
            }
            Ok(v)
        }

        fn name(&self) -> &str {
            "fake-embedder"
        }
    }

    #[tokio::test]
    async fn store_then_search_finds_the_closest_match() {
        let backend = InMemoryBackend::new();
        let model = FakeEmbedder;

        execute(
            "s1",
            &MemoryStepConfig {
                op: MemoryOp::Store,
                text: "rust ownership rules".into(),
                metadata: json!({"topic": "rust"}),
                top_k: 5,
            },
            &model,
            &backend,
        )
        .await
        .unwrap();

        execute(
            "s2",
            &MemoryStepConfig {
                op: MemoryOp::Store,
                text: "the weather in paris".into(),
                metadata: json!({"topic": "weather"}),
                top_k: 5,
            },
            &model,
            &backend,
        )
        .await
        .unwrap();

        let outcome = execute(
            "s3",
            &MemoryStepConfig {
                op: MemoryOp::Search,
                text: "rust borrow checker".into(),
                metadata: Value::Null,
                top_k: 1,
            },
            &model,
            &backend,
        )
        .await
        .unwrap();

        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        let hits = outcome.output.as_array().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["metadata"]["topic"], json!("rust"));
    }

    #[tokio::test]
    async fn mismatched_dimensions_land_in_separate_tables() {
        let backend = InMemoryBackend::new();
        backend.store("four-d", vec![1.0, 0.0, 0.0, 0.0], Value::Null).await.unwrap();
        backend.store("two-d", vec![1.0, 0.0], Value::Null).await.unwrap();

        let four_d_hits = backend.search(vec![1.0, 0.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(four_d_hits.len(), 1);
        assert_eq!(four_d_hits[0].text, "four-d");

        let two_d_hits = backend.search(vec![1.0, 0.0], 5).await.unwrap();
        assert_eq!(two_d_hits.len(), 1);
        assert_eq!(two_d_hits[0].text, "two-d");
    }
}
