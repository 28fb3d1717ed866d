use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by the retrieval index and its sub-stores.
///
/// Every variant leaves the in-memory index exactly as it was before the
/// failing call.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Length mismatch: {chunks} chunks but {tags} tag maps")]
    LengthMismatch { chunks: usize, tags: usize },

    #[error("Index out of range: {position} >= {len}")]
    IndexOutOfRange { position: usize, len: usize },

    #[error("Embedding collaborator returned {actual} vectors for {expected} texts")]
    MalformedEmbeddings { expected: usize, actual: usize },

    #[error("Persistence failure at {path:?}: {source}")]
    PersistenceFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Collaborator unreachable: {0}")]
    CollaboratorUnreachable(String),
}

impl IndexError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PersistenceFailure {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_counts() {
        let err = IndexError::DimensionMismatch {
            expected: 384,
            actual: 768,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 384, got 768");

        let err = IndexError::LengthMismatch { chunks: 3, tags: 2 };
        assert!(err.to_string().contains("3 chunks but 2 tag maps"));
    }

    #[test]
    fn test_persistence_failure_exposes_source() {
        let err = IndexError::persistence(
            "/tmp/db/vectors.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("vectors.bin"));
    }
}
