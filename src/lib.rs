//! Drive two Ollama-compatible endpoints against each other on a topic,
//! alternating generation requests between two personas and writing the
//! resulting conversation to a transcript file.
//!
//! The orchestration loop is independent of any front end: callers supply
//! [`orchestrator::ConversationSettings`] plus two backends, receive an event
//! per completed turn, and may cancel at any time through the returned handle.

pub use endpoint::ollama::{GenerationOptions, OllamaEndpoint, PullProgress, list_models};
pub use endpoint::{BackoffPolicy, ChatBackend, ChatMessage, Role};
pub use error::EndpointError;
pub use orchestrator::{
    Canceller, ConversationEvent, ConversationHandle, ConversationSettings, Outcome, Persona,
    Speaker, start,
};
pub use transcript::{
    SpeakerInfo, TranscriptHeader, TranscriptWriter, Turn, derive_log_path, read_transcript,
};

pub mod endpoint;
pub mod error;
pub mod orchestrator;
pub mod transcript;
