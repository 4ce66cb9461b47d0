//! Error types for the presentation pipeline.
//!
//! Library seams return these `thiserror` enums so callers can decide what is
//! recoverable (a single code block failing) and what is structural (an empty
//! document, an LLM outage). The CLI and config layers wrap them in `anyhow`.

use crate::models::ResearchDocument;

/// Errors from the LLM query client.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("LLM API returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("invalid response format: {message}")]
    InvalidResponseFormat { message: String },

    #[error("API key environment variable {var} not set")]
    MissingApiKey { var: String },
}

impl QueryError {
    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        QueryError::Network {
            message: err.to_string(),
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        QueryError::InvalidResponseFormat {
            message: message.into(),
        }
    }
}

/// Errors from conducting research on a topic.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("topic must not be empty")]
    EmptyTopic,

    /// The query failed. `partial` holds whatever text streamed in before
    /// the failure so callers can keep showing it.
    #[error("research query failed: {source}")]
    Query {
        #[source]
        source: QueryError,
        partial: Box<ResearchDocument>,
    },
}

/// Errors from turning a research document into an outline.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("source document is empty")]
    EmptySourceDocument,

    #[error("source document is still streaming")]
    IncompleteSourceDocument,

    #[error("model returned an empty outline")]
    EmptyOutline,

    #[error("outline query failed: {0}")]
    Query(#[from] QueryError),
}

/// Errors from the statistical runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("runtime failure: {detail}")]
    RuntimeFailure { detail: String },

    #[error("runtime timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("runtime produced no output: {detail}")]
    OutputMissing { detail: String },

    /// Scratch directory or script file could not be prepared.
    #[error("runtime I/O error: {detail}")]
    Io { detail: String },
}

/// Errors from the content cache.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("artifact of {size_bytes} bytes exceeds cache capacity of {max_size_bytes} bytes")]
    ArtifactTooLarge { size_bytes: u64, max_size_bytes: u64 },
}

/// Errors from compiling an outline into a deck.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("outline is empty")]
    EmptyOutline,

    #[error("render error: {message}")]
    Render { message: String },
}
