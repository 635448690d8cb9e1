//! Completion-service client: text generation plus function-calling over an
//! OpenAI-compatible chat completions endpoint.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use leadline_core::config::{LlmConfig, LlmProvider};
use leadline_core::domain::history::{HistoryMessage, Role};
use leadline_core::domain::turn::ToolCallRequest;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request failed: {0}")]
    Request(String),
    #[error("completion response was malformed: {0}")]
    Malformed(String),
}

/// What a tool-enabled call produced: either plain text, or one or more
/// proposed tool calls (never both populated by the HTTP client).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletionOutcome {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[HistoryMessage],
    ) -> Result<String, CompletionError>;

    async fn generate_with_tools(
        &self,
        system_prompt: &str,
        messages: &[HistoryMessage],
        tool_schemas: &[Value],
    ) -> Result<CompletionOutcome, CompletionError>;
}

pub struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpCompletionClient {
    pub fn from_config(config: &LlmConfig) -> Result<Self, CompletionError> {
        let base_url = match (config.provider, config.base_url.as_deref()) {
            (_, Some(url)) => url.trim_end_matches('/').to_string(),
            (LlmProvider::OpenAi, None) => "https://api.openai.com/v1".to_string(),
            (LlmProvider::Ollama, None) => {
                return Err(CompletionError::Request(
                    "ollama provider requires llm.base_url".to_string(),
                ))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|error| CompletionError::Request(error.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.as_ref().map(|key| key.expose_secret().to_string()),
            model: config.model.clone(),
        })
    }

    fn wire_messages(system_prompt: &str, messages: &[HistoryMessage]) -> Vec<Value> {
        let mut wire = vec![json!({"role": "system", "content": system_prompt})];
        for message in messages {
            let role = match message.role {
                Role::Admin => "user",
                Role::Assistant => "assistant",
            };
            wire.push(json!({"role": role, "content": message.content}));
        }
        wire
    }

    async fn post_chat(&self, body: Value) -> Result<ChatResponse, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response =
            request.send().await.map_err(|error| CompletionError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(CompletionError::Request(format!(
                "completion endpoint returned {status}: {detail}"
            )));
        }

        response.json().await.map_err(|error| CompletionError::Malformed(error.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: Option<String>,
}

fn decode_tool_calls(calls: Vec<WireToolCall>) -> Vec<ToolCallRequest> {
    calls
        .into_iter()
        .map(|call| {
            // Unparseable argument payloads degrade to an empty object; the
            // registry's required-field validation reports what is missing.
            let arguments = call
                .function
                .arguments
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_else(|| json!({}));
            ToolCallRequest { name: call.function.name, arguments }
        })
        .collect()
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn generate(
        &self,
        system_prompt: &str,
        messages: &[HistoryMessage],
    ) -> Result<String, CompletionError> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": Self::wire_messages(system_prompt, messages),
        });

        let response = self.post_chat(body).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Malformed("no choices in response".to_string()))?;
        choice
            .message
            .content
            .filter(|content| !content.is_empty())
            .ok_or_else(|| CompletionError::Malformed("empty completion content".to_string()))
    }

    async fn generate_with_tools(
        &self,
        system_prompt: &str,
        messages: &[HistoryMessage],
        tool_schemas: &[Value],
    ) -> Result<CompletionOutcome, CompletionError> {
        let tools: Vec<Value> = tool_schemas
            .iter()
            .map(|schema| json!({"type": "function", "function": schema}))
            .collect();
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": Self::wire_messages(system_prompt, messages),
            "tools": tools,
        });

        let response = self.post_chat(body).await?;
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompletionError::Malformed("no choices in response".to_string()))?;

        let tool_calls = decode_tool_calls(choice.message.tool_calls);
        if tool_calls.is_empty() {
            Ok(CompletionOutcome { text: choice.message.content, tool_calls: Vec::new() })
        } else {
            Ok(CompletionOutcome { text: None, tool_calls })
        }
    }
}

/// Deterministic stand-in for tests: pops pre-queued outcomes in order and
/// records every prompt it was given.
#[derive(Default)]
pub struct ScriptedCompletionClient {
    outcomes: Mutex<VecDeque<Result<CompletionOutcome, String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedCompletionClient {
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Ok(CompletionOutcome { text: Some(text.into()), tool_calls: Vec::new() }));
    }

    pub fn push_tool_call(&self, name: impl Into<String>, arguments: Value) {
        self.push(Ok(CompletionOutcome {
            text: None,
            tool_calls: vec![ToolCallRequest { name: name.into(), arguments }],
        }));
    }

    pub fn push_error(&self, detail: impl Into<String>) {
        self.push(Err(detail.into()));
    }

    fn push(&self, outcome: Result<CompletionOutcome, String>) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push_back(outcome);
        }
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|prompts| prompts.clone()).unwrap_or_default()
    }

    pub fn calls_made(&self) -> usize {
        self.recorded_prompts().len()
    }

    fn next(&self, system_prompt: &str) -> Result<CompletionOutcome, CompletionError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(system_prompt.to_string());
        }
        let next = self.outcomes.lock().ok().and_then(|mut outcomes| outcomes.pop_front());
        match next {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(detail)) => Err(CompletionError::Request(detail)),
            None => Err(CompletionError::Request("no scripted outcome queued".to_string())),
        }
    }
}

#[async_trait]
impl CompletionClient for ScriptedCompletionClient {
    async fn generate(
        &self,
        system_prompt: &str,
        _messages: &[HistoryMessage],
    ) -> Result<String, CompletionError> {
        let outcome = self.next(system_prompt)?;
        outcome
            .text
            .ok_or_else(|| CompletionError::Malformed("scripted outcome had no text".to_string()))
    }

    async fn generate_with_tools(
        &self,
        system_prompt: &str,
        _messages: &[HistoryMessage],
        _tool_schemas: &[Value],
    ) -> Result<CompletionOutcome, CompletionError> {
        self.next(system_prompt)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_tool_calls, WireFunction, WireToolCall};

    #[test]
    fn tool_call_arguments_parse_from_wire_strings() {
        let calls = decode_tool_calls(vec![WireToolCall {
            function: WireFunction {
                name: "create_lead".to_string(),
                arguments: Some(r#"{"name": "Asha", "phone": "555"}"#.to_string()),
            },
        }]);

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "create_lead");
        assert_eq!(calls[0].arguments, json!({"name": "Asha", "phone": "555"}));
    }

    #[test]
    fn malformed_arguments_degrade_to_empty_object() {
        let calls = decode_tool_calls(vec![WireToolCall {
            function: WireFunction {
                name: "delete_lead".to_string(),
                arguments: Some("{not json".to_string()),
            },
        }]);

        assert_eq!(calls[0].arguments, json!({}));
    }
}
