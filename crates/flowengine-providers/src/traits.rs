// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! Provider trait definitions (re-exported from core so callers only need one import
//! for either the trait or a concrete implementation).

pub use flowengine_core::providers::{
    CompletionRequest, CompletionResponse, LanguageModel, ProviderError, ToolCall, ToolSchema,
};
