use meshline_core::{CoreError, SpanId};
use thiserror::Error;

/// Errors that can occur during tracing operations
#[derive(Error, Debug)]
pub enum TraceError {
    /// Mutation or end of a span that has already ended. Logged, never returned to callers
    /// of span mutators.
    #[error("Span {span_id} is already ended; ignoring {operation}")]
    InvalidSpanState {
        span_id: SpanId,
        operation: &'static str,
    },

    #[error("Failed to export traces: {0}")]
    Export(String),

    #[error("Invalid trace context: {0}")]
    InvalidTraceContext(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Result type for tracing operations
pub type TraceResult<T> = Result<T, TraceError>;

impl From<reqwest::Error> for TraceError {
    fn from(err: reqwest::Error) -> Self {
        TraceError::Export(err.to_string())
    }
}
