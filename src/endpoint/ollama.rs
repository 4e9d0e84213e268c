//! Client for the Ollama HTTP API: `/api/tags`, `/api/pull`, `/api/chat`.

use std::fmt;
use std::time::Duration;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{BackoffPolicy, ChatBackend, ChatMessage};
use crate::error::EndpointError;

const LIST_TIMEOUT: Duration = Duration::from_secs(15);

/// Per-request knobs, fixed for the lifetime of an endpoint.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub num_predict: u32,
    pub timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            num_predict: 300,
            timeout: Duration::from_secs(180),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One reachable model-serving node plus a selected model.
///
/// Holds no state beyond the reused connection pool.
pub struct OllamaEndpoint {
    client: reqwest::Client,
    base_url: String,
    model: String,
    options: GenerationOptions,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: ResponseMessage,
    done_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: Option<String>,
    model: Option<String>,
}

/// One NDJSON progress line of a model download.
#[derive(Debug, Clone, Deserialize)]
pub struct PullProgress {
    #[serde(default)]
    pub status: String,
    pub completed: Option<u64>,
    pub total: Option<u64>,
}

impl fmt::Display for PullProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.completed, self.total) {
            (Some(completed), Some(total)) if total > 0 => {
                let percent = completed * 100 / total;
                write!(f, "{} {percent}% ({completed}/{total})", self.status)
            }
            _ => write!(f, "{}", self.status),
        }
    }
}

/// List the model names available on a node, sorted.
pub async fn list_models(base_url: &str) -> Result<Vec<String>, EndpointError> {
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    let client = reqwest::Client::new();

    let response = client
        .get(&url)
        .timeout(LIST_TIMEOUT)
        .send()
        .await
        .map_err(|source| EndpointError::Connection {
            url: url.clone(),
            source,
        })?
        .error_for_status()
        .map_err(|source| protocol(&url, &source))?;

    let tags: TagsResponse = response
        .json()
        .await
        .map_err(|source| protocol(&url, &source))?;

    let mut models: Vec<String> = tags
        .models
        .into_iter()
        .filter_map(|entry| entry.name.or(entry.model))
        .collect();
    models.sort();
    Ok(models)
}

impl OllamaEndpoint {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            client: reqwest::Client::new(),
            base_url,
            model: model.into(),
            options,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Download the selected model, yielding a progress update per NDJSON
    /// line. The download runs only while the stream is polled; dropping the
    /// stream abandons it.
    pub fn pull(&self) -> impl Stream<Item = Result<PullProgress, EndpointError>> + Send + '_ {
        try_stream! {
            let url = format!("{}/api/pull", self.base_url);
            let response = self
                .client
                .post(&url)
                .json(&serde_json::json!({ "name": self.model }))
                .send()
                .await
                .map_err(|source| EndpointError::Connection { url: url.clone(), source })?
                .error_for_status()
                .map_err(|source| protocol(&url, &source))?;

            let mut body = response.bytes_stream();
            let mut buffer = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|source| protocol(&url, &source))?;
                buffer.extend_from_slice(&chunk);
                while let Some(newline) = buffer.iter().position(|&byte| byte == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    if let Some(progress) = parse_pull_line(&url, &line)? {
                        yield progress;
                    }
                }
            }
            if let Some(progress) = parse_pull_line(&url, &buffer)? {
                yield progress;
            }
        }
    }

    /// One chat completion over the given context, with timeout retries per
    /// the configured backoff policy. Non-timeout errors are not retried.
    pub async fn generate(&self, messages: &[ChatMessage]) -> Result<String, EndpointError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
            options: ChatOptions {
                temperature: self.options.temperature,
                num_predict: self.options.num_predict,
            },
        };

        let max_attempts = self.options.backoff.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = self
                .client
                .post(&url)
                .timeout(self.options.timeout)
                .json(&request)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(source) if source.is_timeout() => {
                    if attempt >= max_attempts {
                        return Err(EndpointError::GenerationTimeout {
                            url,
                            attempts: attempt,
                        });
                    }
                    let delay = self.options.backoff.delay_before(attempt);
                    tracing::warn!(
                        %url,
                        attempt,
                        max_attempts,
                        "generation call timed out; retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(source) => return Err(EndpointError::Connection { url, source }),
            };

            let response = response
                .error_for_status()
                .map_err(|source| protocol(&url, &source))?;
            let body: ChatResponse = response
                .json()
                .await
                .map_err(|source| protocol(&url, &source))?;

            if body.done_reason.as_deref() == Some("length") {
                tracing::info!(model = %self.model, "reply hit the num_predict cap");
            }
            return Ok(body.message.content.trim().to_owned());
        }
    }
}

impl ChatBackend for OllamaEndpoint {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, EndpointError> {
        OllamaEndpoint::generate(self, messages).await
    }
}

fn protocol(url: &str, source: &dyn std::error::Error) -> EndpointError {
    EndpointError::Protocol {
        url: url.to_owned(),
        detail: source.to_string(),
    }
}

fn parse_pull_line(url: &str, line: &[u8]) -> Result<Option<PullProgress>, EndpointError> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|source| protocol(url, &source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_matches_the_wire_format() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("From Jane: hello"),
        ];
        let request = ChatRequest {
            model: "llama3:8b",
            messages: &messages,
            stream: false,
            options: ChatOptions {
                temperature: 0.5,
                num_predict: 300,
            },
        };

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "model": "llama3:8b",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "From Jane: hello"},
                ],
                "stream": false,
                "options": {"temperature": 0.5, "num_predict": 300},
            })
        );
    }

    #[test]
    fn tag_entries_fall_back_to_the_model_field() {
        let tags: TagsResponse = serde_json::from_str(
            r#"{"models": [{"model": "qwen2:7b"}, {"name": "llama3:8b"}, {}]}"#,
        )
        .unwrap();

        let names: Vec<String> = tags
            .models
            .into_iter()
            .filter_map(|entry| entry.name.or(entry.model))
            .collect();
        assert_eq!(names, ["qwen2:7b", "llama3:8b"]);
    }

    #[test]
    fn chat_response_tolerates_missing_message() {
        let body: ChatResponse = serde_json::from_str(r#"{"done": true}"#).unwrap();
        assert_eq!(body.message.content, "");
        assert_eq!(body.done_reason, None);
    }

    #[test]
    fn pull_progress_formats_a_percentage() {
        let progress = PullProgress {
            status: "pulling manifest".to_owned(),
            completed: Some(256),
            total: Some(1024),
        };
        assert_eq!(progress.to_string(), "pulling manifest 25% (256/1024)");

        let bare = PullProgress {
            status: "verifying sha256 digest".to_owned(),
            completed: None,
            total: None,
        };
        assert_eq!(bare.to_string(), "verifying sha256 digest");
    }
}
