//! The unit of work accepted by the router

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::domain_types::EndpointName;
use crate::error::RouteError;

/// Caller-supplied hint about the kind of task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskHint {
    /// Writing or editing code
    Coding,
    /// Diagnosing a failure
    Debugging,
    /// Reading and explaining existing material
    Analysis,
    /// Free-form generation
    Generation,
    /// Anything else
    General,
}

/// A routable request
#[derive(Debug, Clone)]
pub struct RouteRequest {
    /// The prompt text
    pub prompt: String,
    /// Optional additional context appended to the prompt for analysis
    pub context: Option<String>,
    /// Optional task hint
    pub task_hint: Option<TaskHint>,
    /// Paths or directories to analyze and fold into the prompt
    pub file_inputs: Vec<String>,
    /// Explicit endpoint override; bypasses selection, not safety
    pub force_endpoint: Option<EndpointName>,
    /// Caller override of the response token budget
    pub max_tokens_override: Option<u32>,
    /// Absolute cut-off; downstream calls must not outlive it
    pub deadline: Option<Instant>,
}

impl RouteRequest {
    /// Creates a request with just a prompt
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: None,
            task_hint: None,
            file_inputs: Vec::new(),
            force_endpoint: None,
            max_tokens_override: None,
            deadline: None,
        }
    }

    /// Prompt and context joined for fingerprinting and classification
    #[must_use]
    pub fn combined_text(&self) -> String {
        match &self.context {
            Some(context) if !context.is_empty() => format!("{}\n{}", self.prompt, context),
            _ => self.prompt.clone(),
        }
    }

    /// Rejects structurally unusable requests
    ///
    /// # Errors
    /// Returns `RouteError::InvalidRequest` when the prompt is blank.
    pub fn validate(&self) -> Result<(), RouteError> {
        if self.prompt.trim().is_empty() {
            return Err(RouteError::InvalidRequest {
                reason: "prompt must not be empty".to_string(),
            });
        }
        Ok(())
    }

    /// Remaining time before the deadline, if one is set
    #[must_use]
    pub fn remaining(&self) -> Option<std::time::Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_prompt_is_invalid() {
        assert!(RouteRequest::new("   ").validate().is_err());
        assert!(RouteRequest::new("hello").validate().is_ok());
    }

    #[test]
    fn test_combined_text_appends_context() {
        let mut request = RouteRequest::new("prompt");
        assert_eq!(request.combined_text(), "prompt");
        request.context = Some("context".to_string());
        assert_eq!(request.combined_text(), "prompt\ncontext");
    }
}
