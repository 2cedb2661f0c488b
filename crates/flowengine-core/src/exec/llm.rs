// Copyright (c) 2025 Flowengine Contributors
// SPDX-License-Identifier: Apache-2.0

//! `llm` step execution: drives an agent through a tool-call loop, bounded by
//! `max_iterations`, with support for handing the conversation off to a different
//! named agent (bounded by `max_agent_handoffs`), an `ask` built-in that suspends the
//! step for human input, and `outputSchema`-constrained final output (spec §4.1/§4.7).

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{StepExecOutcome, StepOutcome};
use crate::error::EngineError;
use crate::providers::{CompletionRequest, CompletionResponse, LanguageModel, ToolSchema};
use crate::workflow::LlmStepConfig;

const HANDOFF_TOOL_NAME: &str = "transfer_to_agent";
const ASK_TOOL_NAME: &str = "ask";

/// Resolves a tool call's name + arguments to a result, abstracting over whichever
/// MCP client actually owns that tool -- the runner wires this up from its registered
/// `McpClient`s so this module doesn't need to depend on the MCP transport types.
pub type ToolDispatch<'a> = dyn Fn(String, serde_json::Value) -> BoxFuture<'a, Result<serde_json::Value, EngineError>> + 'a;

/// What a previously-suspended `ask` carries back in on resume: the conversation as
/// it stood when `ask` was invoked, plus the answer to inject as that call's result.
#[derive(Debug, Clone)]
pub struct AskResume {
    pub transcript: String,
    pub answer: String,
}

pub async fn execute<'a>(
    step_id: &str,
    config: &LlmStepConfig,
    rendered_prompt: String,
    models: &HashMap<String, Arc<dyn LanguageModel>>,
    tools: Vec<ToolSchema>,
    call_tool: &ToolDispatch<'a>,
    output_schema: Option<&Value>,
    resume: Option<AskResume>,
) -> Result<StepExecOutcome, EngineError> {
    let mut agent_name = config.agent.clone().unwrap_or_else(|| "default".to_string());
    let mut handoffs = 0u32;
    let mut conversation = match resume {
        Some(r) => format!("{}\n\n[tool {ASK_TOOL_NAME} result]: {}", r.transcript, r.answer),
        None => rendered_prompt,
    };
    let mut last_response: Option<CompletionResponse> = None;

    for _ in 0..config.max_iterations {
        let model = models
            .get(&agent_name)
            .ok_or_else(|| EngineError::Config(format!("unknown agent: {agent_name}")))?;

        let response = model
            .complete(CompletionRequest {
                model: config.model.clone().unwrap_or_else(|| agent_name.clone()),
                prompt: conversation.clone(),
                system: config.system.clone(),
                temperature: config.temperature,
                max_tokens: None,
                tools: tools.clone(),
                extra: Default::default(),
            })
            .await
            .map_err(|e| EngineError::step_execution(step_id, e.to_string()))?;

        if response.tool_calls.is_empty() {
            last_response = Some(response);
            break;
        }

        for call in &response.tool_calls {
            if call.name == HANDOFF_TOOL_NAME {
                handoffs += 1;
                if handoffs > config.max_agent_handoffs {
                    return Err(EngineError::step_execution(step_id, "exceeded max_agent_handoffs"));
                }
                if let Some(next) = call.arguments.get("agent").and_then(|v| v.as_str()) {
                    agent_name = next.to_string();
                }
                continue;
            }
            if call.name == ASK_TOOL_NAME {
                // No TTY exists in this execution context: every `ask` suspends the
                // step and waits for the run to be resumed with an answer.
                let question = call
                    .arguments
                    .get("question")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                return Ok(StepExecOutcome::Suspended {
                    event_name: format!("ask:{step_id}"),
                    payload: serde_json::json!({"question": question, "messages": conversation}),
                });
            }
            let result = call_tool(call.name.clone(), call.arguments.clone()).await?;
            conversation.push_str(&format!("\n\n[tool {} result]: {result}", call.name));
        }
        last_response = Some(response);
    }

    let response = last_response.ok_or_else(|| {
        EngineError::step_execution(step_id, format!("exceeded max_iterations ({})", config.max_iterations))
    })?;

    let output = match output_schema {
        Some(schema) => {
            let candidate = extract_json_candidate(&response.text).ok_or_else(|| EngineError::Schema {
                step_id: Some(step_id.to_string()),
                message: "output schema violation: no JSON object found in model output".to_string(),
            })?;
            let parsed: Value = serde_json::from_str(candidate).map_err(|e| EngineError::Schema {
                step_id: Some(step_id.to_string()),
                message: format!("output schema violation: {e}"),
            })?;
            crate::schema::validate(step_id, schema, &parsed)?;
            parsed
        }
        None => serde_json::json!({
            "text": response.text,
            "model": response.model,
            "tokens_used": response.tokens_used,
        }),
    };

    Ok(StepExecOutcome::Completed(StepOutcome::simple(output)))
}

/// Pulls a JSON object candidate out of a model's free-form text: a fenced code
/// block first (optionally tagged `json`), then the first balanced `{...}` span.
fn extract_json_candidate(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        let after = after.trim_start_matches('\n');
        if let Some(end) = after.find("```") {
            return Some(after[..end].trim());
        }
    }

    let open = text.find('{')?;
    let mut depth = 0i32;
    for (i, ch) in text[open..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[open..open + i + ch.len_utf8()].trim());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderError, ToolCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedModel {
        responses: std::sync::Mutex<Vec<CompletionResponse>>,
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
            Ok(self.responses.lock().unwrap().remove(0))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn config() -> LlmStepConfig {
        LlmStepConfig {
            agent: Some("default".into()),
            prompt: "do the thing".into(),
            system: None,
            tools: vec![],
            mcp_servers: vec![],
            max_iterations: 5,
            max_agent_handoffs: 2,
            model: None,
            temperature: None,
        }
    }

    fn no_tool_dispatch<'a>() -> Box<ToolDispatch<'a>> {
        Box::new(|_name, _args| Box::pin(async { Err(EngineError::Config("no tools registered".into())) }))
    }

    #[tokio::test]
    async fn returns_text_when_no_tool_calls() {
        let model = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "done".into(),
                model: "m".into(),
                tokens_used: Some(10),
                tool_calls: vec![],
                metadata: Default::default(),
            }]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(model));
        let dispatch = no_tool_dispatch();
        let outcome = execute("s1", &config(), "prompt".into(), &models, vec![], &*dispatch, None, None)
            .await
            .unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output["text"], json!("done"));
    }

    #[tokio::test]
    async fn invokes_tool_then_returns_final_text() {
        let model = ScriptedModel {
            responses: std::sync::Mutex::new(vec![
                CompletionResponse {
                    text: "".into(),
                    model: "m".into(),
                    tokens_used: None,
                    tool_calls: vec![ToolCall {
                        id: "1".into(),
                        name: "search".into(),
                        arguments: json!({"q": "rust"}),
                    }],
                    metadata: Default::default(),
                },
                CompletionResponse {
                    text: "final answer".into(),
                    model: "m".into(),
                    tokens_used: None,
                    tool_calls: vec![],
                    metadata: Default::default(),
                },
            ]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(model));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = Arc::clone(&calls);
        let dispatch: Box<ToolDispatch> = Box::new(move |_name, _args| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(json!({"results": []})) })
        });
        let outcome = execute("s1", &config(), "prompt".into(), &models, vec![], &*dispatch, None, None)
            .await
            .unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output["text"], json!("final answer"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handoff_switches_agent() {
        let first = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "".into(),
                model: "m".into(),
                tokens_used: None,
                tool_calls: vec![ToolCall {
                    id: "1".into(),
                    name: HANDOFF_TOOL_NAME.into(),
                    arguments: json!({"agent": "specialist"}),
                }],
                metadata: Default::default(),
            }]),
        };
        let second = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "handled by specialist".into(),
                model: "m".into(),
                tokens_used: None,
                tool_calls: vec![],
                metadata: Default::default(),
            }]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(first));
        models.insert("specialist".into(), Arc::new(second));
        let dispatch = no_tool_dispatch();
        let outcome = execute("s1", &config(), "prompt".into(), &models, vec![], &*dispatch, None, None)
            .await
            .unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output["text"], json!("handled by specialist"));
    }

    #[tokio::test]
    async fn ask_suspends_with_question_and_transcript() {
        let model = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "".into(),
                model: "m".into(),
                tokens_used: None,
                tool_calls: vec![ToolCall {
                    id: "1".into(),
                    name: ASK_TOOL_NAME.into(),
                    arguments: json!({"question": "which region?"}),
                }],
                metadata: Default::default(),
            }]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(model));
        let dispatch = no_tool_dispatch();
        let outcome = execute("s1", &config(), "prompt".into(), &models, vec![], &*dispatch, None, None)
            .await
            .unwrap();
        let StepExecOutcome::Suspended { event_name, payload } = outcome else {
            panic!("expected suspension")
        };
        assert_eq!(event_name, "ask:s1");
        assert_eq!(payload["question"], json!("which region?"));
        assert_eq!(payload["messages"], json!("prompt"));
    }

    #[tokio::test]
    async fn resume_injects_answer_as_tool_result() {
        let model = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "using us-east".into(),
                model: "m".into(),
                tokens_used: None,
                tool_calls: vec![],
                metadata: Default::default(),
            }]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(model));
        let dispatch = no_tool_dispatch();
        let resume = AskResume {
            transcript: "prompt\n\n[tool ask]: which region?".into(),
            answer: "us-east".into(),
        };
        let outcome = execute(
            "s1",
            &config(),
            "prompt".into(),
            &models,
            vec![],
            &*dispatch,
            None,
            Some(resume),
        )
        .await
        .unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output["text"], json!("using us-east"));
    }

    #[tokio::test]
    async fn output_schema_parses_fenced_json() {
        let model = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "here you go:\n```json\n{\"ok\": true}\n```\n".into(),
                model: "m".into(),
                tokens_used: None,
                tool_calls: vec![],
                metadata: Default::default(),
            }]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(model));
        let dispatch = no_tool_dispatch();
        let schema = json!({"type": "object", "required": ["ok"]});
        let outcome = execute(
            "s1",
            &config(),
            "prompt".into(),
            &models,
            vec![],
            &*dispatch,
            Some(&schema),
            None,
        )
        .await
        .unwrap();
        let StepExecOutcome::Completed(outcome) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(outcome.output, json!({"ok": true}));
    }

    #[tokio::test]
    async fn output_schema_violation_fails_as_schema_error() {
        let model = ScriptedModel {
            responses: std::sync::Mutex::new(vec![CompletionResponse {
                text: "no json here".into(),
                model: "m".into(),
                tokens_used: None,
                tool_calls: vec![],
                metadata: Default::default(),
            }]),
        };
        let mut models: HashMap<String, Arc<dyn LanguageModel>> = HashMap::new();
        models.insert("default".into(), Arc::new(model));
        let dispatch = no_tool_dispatch();
        let schema = json!({"type": "object"});
        let err = execute(
            "s1",
            &config(),
            "prompt".into(),
            &models,
            vec![],
            &*dispatch,
            Some(&schema),
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Schema { .. }));
    }
}
