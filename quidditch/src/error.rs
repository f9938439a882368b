use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse error at `{path}`: {reason}")]
    Parse { path: String, reason: String },

    #[error("type error at `{path}`: {reason}")]
    Type { path: String, reason: String },

    #[error("from + size = {requested} exceeds max_from_plus_size = {limit}")]
    DeepPaginationExceeded { requested: usize, limit: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("schema mismatch for field `{field}`: {reason}")]
    SchemaMismatch { field: String, reason: String },

    #[error("stale routing: planned against version {requested}, node knows {known}")]
    StaleRouting { requested: u64, known: u64 },

    #[error("shard unavailable: {0}")]
    ShardUnavailable(String),

    #[error("deadline exceeded")]
    TimedOut,

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn parse(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn type_mismatch(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Type {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn schema(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Stable name for metrics labels and structured error responses.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Parse { .. } => "parse_error",
            Error::Type { .. } => "type_error",
            Error::DeepPaginationExceeded { .. } => "parse_error",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::SchemaMismatch { .. } => "schema_mismatch",
            Error::StaleRouting { .. } => "stale_routing",
            Error::ShardUnavailable(_) => "shard_unavailable",
            Error::TimedOut => "timed_out",
            Error::Overloaded(_) => "overloaded",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Encoding(_) => "encoding",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
