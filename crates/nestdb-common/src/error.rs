//! Error definitions for NestDB

use thiserror::Error;

/// Represents errors that can occur during NestDB operations.
///
/// Every variant maps to a stable short token (see [`NestError::kind`])
/// so frontends can translate errors without parsing messages.
#[derive(Error, Debug, Clone)]
pub enum NestError {
    // Not found
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("index '{0}' not found")]
    IndexNotFound(String),

    #[error("row {0} does not exist")]
    RowDoesNotExist(usize),

    #[error("row position {0} out of range")]
    RowOutOfRange(usize),

    // Conflict
    #[error("collection '{0}' already exists")]
    CollectionExists(String),

    #[error("index '{0}' already exists")]
    IndexAlreadyExists(String),

    #[error("index conflict: field '{field}' with value '{value}'")]
    IndexConflict { field: String, value: String },

    #[error("collection is closed")]
    CollectionClosed,

    // Bad input
    #[error("malformed json: {0}")]
    MalformedJson(String),

    #[error("index type '{0}' is not registered")]
    UnsupportedIndexType(String),

    #[error("invalid index options: {0}")]
    InvalidOptions(String),

    #[error("unsupported value type: {0}")]
    UnsupportedValueType(String),

    #[error("field '{0}' is indexed and mandatory")]
    MissingIndexedField(String),

    // IO
    #[error("persistence write failed: {0}")]
    PersistenceWrite(String),

    #[error("persistence read failed: {0}")]
    PersistenceRead(String),

    // Transient
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("network error: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, NestError>;

impl NestError {
    /// Get a short stable error kind token.
    pub fn kind(&self) -> &'static str {
        match self {
            NestError::CollectionNotFound(_) => "collection_not_found",
            NestError::IndexNotFound(_) => "index_not_found",
            NestError::RowDoesNotExist(_) => "row_does_not_exist",
            NestError::RowOutOfRange(_) => "row_out_of_range",
            NestError::CollectionExists(_) => "collection_exists",
            NestError::IndexAlreadyExists(_) => "index_already_exists",
            NestError::IndexConflict { .. } => "index_conflict",
            NestError::CollectionClosed => "collection_closed",
            NestError::MalformedJson(_) => "malformed_json",
            NestError::UnsupportedIndexType(_) => "unsupported_index_type",
            NestError::InvalidOptions(_) => "invalid_options",
            NestError::UnsupportedValueType(_) => "unsupported_value_type",
            NestError::MissingIndexedField(_) => "missing_indexed_field",
            NestError::PersistenceWrite(_) => "persistence_write_failed",
            NestError::PersistenceRead(_) => "persistence_read_failed",
            NestError::Unavailable(_) => "unavailable",
            NestError::Network(_) => "network_error",
        }
    }

    /// Whether the error indicates the local state has diverged from a
    /// replicated command stream and the collection must be rebuilt.
    pub fn is_divergence(&self) -> bool {
        matches!(
            self,
            NestError::RowDoesNotExist(_)
                | NestError::RowOutOfRange(_)
                | NestError::IndexNotFound(_)
                | NestError::IndexAlreadyExists(_)
                | NestError::IndexConflict { .. }
        )
    }

    /// Shortcut for wrapping a write-path IO error.
    pub fn write_failed(err: impl std::fmt::Display) -> Self {
        NestError::PersistenceWrite(err.to_string())
    }

    /// Shortcut for wrapping a read-path IO error.
    pub fn read_failed(err: impl std::fmt::Display) -> Self {
        NestError::PersistenceRead(err.to_string())
    }
}

/// Convert serde_json errors to NestError
///
/// Shortcut as it's a common error we need to convert from.
impl From<serde_json::Error> for NestError {
    fn from(err: serde_json::Error) -> Self {
        NestError::MalformedJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tokens_are_stable() {
        assert_eq!(
            NestError::CollectionNotFound("users".into()).kind(),
            "collection_not_found"
        );
        assert_eq!(NestError::CollectionClosed.kind(), "collection_closed");
        assert_eq!(
            NestError::IndexConflict {
                field: "id".into(),
                value: "a".into()
            }
            .kind(),
            "index_conflict"
        );
    }

    #[test]
    fn test_divergence_classification() {
        assert!(NestError::RowDoesNotExist(3).is_divergence());
        assert!(NestError::RowOutOfRange(9).is_divergence());
        assert!(NestError::IndexAlreadyExists("by_id".into()).is_divergence());
        assert!(!NestError::CollectionClosed.is_divergence());
        assert!(!NestError::MalformedJson("oops".into()).is_divergence());
    }

    #[test]
    fn test_messages_identify_the_failure() {
        let err = NestError::IndexConflict {
            field: "id".into(),
            value: "a".into(),
        };
        assert_eq!(err.to_string(), "index conflict: field 'id' with value 'a'");
        assert_eq!(
            NestError::RowDoesNotExist(7).to_string(),
            "row 7 does not exist"
        );
    }
}
