pub mod ollama;

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EndpointError;

/// One message of the chat context sent to a model-serving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// The generation seam between the orchestrator and a model-serving node.
///
/// [`ollama::OllamaEndpoint`] is the real implementation; tests drive the
/// orchestrator with scripted fakes.
pub trait ChatBackend {
    /// Model identifier, as reported in transcript labels.
    fn model(&self) -> &str;

    /// Run one generation over the given chat context.
    fn generate(
        &self,
        messages: &[ChatMessage],
    ) -> impl Future<Output = Result<String, EndpointError>> + Send;
}

/// Retry schedule for generation timeouts.
///
/// The delay before retry `n` (1-based) is `base_delay * multiplier^(n-1)`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total attempts, the first call included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl BackoffPolicy {
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.base_delay
            .mul_f64(self.multiplier.powi(retry.saturating_sub(1) as i32))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(1500),
            multiplier: 2.0,
        }
    }
}
