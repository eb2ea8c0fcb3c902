use thiserror::Error;

#[derive(Debug, Error)]
pub enum BidsError {
    #[error("invalid pattern rule '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("literal rule with empty match text (replacement '{replacement}')")]
    EmptyLiteral { replacement: String },

    #[error("invalid dataset description {path}: {message}")]
    InvalidDescription { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type Result<T> = std::result::Result<T, BidsError>;
