// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Concrete [`LanguageModel`] implementations for flowengine runs.

pub mod anthropic;
pub mod openai;
pub mod traits;

pub use anthropic::AnthropicModel;
pub use openai::OpenAiModel;
pub use traits::{CompletionRequest, CompletionResponse, LanguageModel, ProviderError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
