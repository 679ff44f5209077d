//! Shared test fixtures: a scriptable chat model and AST builders.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::llm::{ChatModel, LlmError};

/// Chat model driven by (needle, response) rules matched against the
/// user prompt, with optional failure injection. Records every call.
pub struct MockChatModel {
    rules: Mutex<Vec<(String, String)>>,
    fail_when_contains: Mutex<Option<String>>,
    default_response: String,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockChatModel {
    pub fn new(default_response: &str) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            fail_when_contains: Mutex::new(None),
            default_response: default_response.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Respond with `response` when the user prompt contains `needle`
    pub fn respond_when(self, needle: &str, response: &str) -> Self {
        self.rules
            .lock()
            .expect("rules lock")
            .push((needle.to_string(), response.to_string()));
        self
    }

    /// Fail with an API error when the user prompt contains `needle`
    pub fn fail_when(self, needle: &str) -> Self {
        *self.fail_when_contains.lock().expect("fail lock") = Some(needle.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }

    pub fn user_prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(_, user)| user.clone())
            .collect()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((system_prompt.to_string(), user_prompt.to_string()));

        if let Some(needle) = self.fail_when_contains.lock().expect("fail lock").as_ref()
            && user_prompt.contains(needle.as_str())
        {
            return Err(LlmError::ApiError(format!("injected failure on '{}'", needle)));
        }

        let rules = self.rules.lock().expect("rules lock");
        for (needle, response) in rules.iter() {
            if user_prompt.contains(needle.as_str()) {
                return Ok(response.clone());
            }
        }
        Ok(self.default_response.clone())
    }
}

/// A context response every parent-context prompt can use
pub const CONTEXT_RESPONSE: &str = r#"{"context": "loop over recent orders"}"#;

/// A one-node analysis response usable for any singleton batch
pub const SINGLE_SUMMARY_RESPONSE: &str =
    r#"{"analysis": [{"summary": "does one thing"}]}"#;
