use crate::street_graph::FetchError;
use thiserror::Error;

/// Errors surfaced by the graph engine to its callers.
///
/// Query misses are not errors; they come back as `None`.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Graph service has shut down")]
    ServiceClosed,
}

pub type GraphResult<T> = Result<T, GraphError>;
