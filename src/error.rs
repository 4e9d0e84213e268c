use thiserror::Error;

/// Failures surfaced by the endpoint client.
///
/// Listing and pulling report transient errors immediately; only generation
/// calls retry, and only on timeout.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The node could not be reached at all.
    #[error("endpoint {url} is unreachable: {source}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The node answered, but not with the expected shape.
    #[error("unexpected response from {url}: {detail}")]
    Protocol { url: String, detail: String },

    /// A generation call timed out and every retry was spent.
    #[error("generation against {url} timed out after {attempts} attempts")]
    GenerationTimeout { url: String, attempts: u32 },

    /// The selected model is not present on the node.
    #[error("model `{model}` is not available on {url}")]
    ModelNotFound { model: String, url: String },
}
