use std::process::{ExitCode, Termination};

/// Errors surfaced by a variant search request.
#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    /// Missing or schema-incompatible backend indices.
    #[error("{0}")]
    Configuration(String),
    /// User-correctable problem with the search filter.
    #[error("{0}")]
    InvalidFilter(String),
    /// The backend timed out; long-running tasks were canceled before giving up.
    #[error("Search backend timed out, canceled {canceled} long running searches")]
    BackendTimeout { canceled: usize },
    /// A requested variant does not exist.
    #[error("{0}")]
    NotFound(String),
    /// Any other backend failure.
    #[error("Search backend failed: {0}")]
    Backend(#[source] anyhow::Error),
}

impl Termination for SearchError {
    fn report(self) -> ExitCode {
        match self {
            SearchError::Configuration(_) => ExitCode::from(2),
            SearchError::InvalidFilter(_) => ExitCode::from(3),
            SearchError::BackendTimeout { .. } => ExitCode::from(4),
            SearchError::NotFound(_) => ExitCode::from(5),
            SearchError::Backend(_) => ExitCode::from(1),
        }
    }
}
