use thiserror::Error;

/// Main error type for graphrepo
#[derive(Error, Debug)]
pub enum GraphRepoError {
    /// Database-related errors (processing index, lock table)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding errors (structure info, cursor marks)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relationship or metadata document could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Value is not a `namespace:localId` identifier
    #[error("Invalid PID: {0}")]
    InvalidPid(String),

    /// Object does not exist in the object store
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    /// Invalid input (query parameters, cursor marks, ...)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Bounded wait on a read/write lock expired
    #[error("Timed out after {waited_ms} ms waiting for {mode} lock on {pid}")]
    LockTimeout {
        pid: String,
        mode: String,
        waited_ms: u64,
    },

    /// The lock backend itself failed
    #[error("Lock server error: {0}")]
    LockServer(String),

    /// The relation graph violates an ownership invariant
    #[error("Invalid graph state: {0}")]
    InvalidGraphState(String),
}

impl GraphRepoError {
    /// True for errors a caller may retry at a higher level.
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, GraphRepoError::LockTimeout { .. })
    }
}

/// Convenient Result type using GraphRepoError
pub type Result<T> = std::result::Result<T, GraphRepoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphRepoError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_lock_timeout_display() {
        let err = GraphRepoError::LockTimeout {
            pid: "uuid:a".to_string(),
            mode: "write".to_string(),
            waited_ms: 250,
        };
        assert!(err.is_lock_timeout());
        assert_eq!(
            err.to_string(),
            "Timed out after 250 ms waiting for write lock on uuid:a"
        );
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: GraphRepoError = rusqlite_err.into();
        assert!(matches!(err, GraphRepoError::Database(_)));
        assert!(!err.is_lock_timeout());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GraphRepoError = io_err.into();
        assert!(matches!(err, GraphRepoError::Io(_)));
    }
}
