#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Serde(String),
    Bincode(String),
    NotFound,

    /// Session round-trip budget exhausted.
    TooManyRequests {
        max: usize,
    },
    IndexNotFound(String),
    InvalidQuery(String),
    IndexingTimeout,

    Other(String),
}

impl Clone for StorageError {
    fn clone(&self) -> Self {
        match self {
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StorageError::Serde(s) => StorageError::Serde(s.clone()),
            StorageError::Bincode(s) => StorageError::Bincode(s.clone()),
            StorageError::NotFound => StorageError::NotFound,
            StorageError::TooManyRequests { max } => StorageError::TooManyRequests { max: *max },
            StorageError::IndexNotFound(s) => StorageError::IndexNotFound(s.clone()),
            StorageError::InvalidQuery(s) => StorageError::InvalidQuery(s.clone()),
            StorageError::IndexingTimeout => StorageError::IndexingTimeout,
            StorageError::Other(s) => StorageError::Other(s.clone()),
        }
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Io(e) => write!(f, "IO error: {}", e),
            StorageError::Serde(e) => write!(f, "JSON error: {}", e),
            StorageError::Bincode(e) => write!(f, "Serialization error: {}", e),
            StorageError::NotFound => write!(f, "Document not found"),
            StorageError::TooManyRequests { max } => {
                write!(f, "Maximum number of requests ({}) reached for this session", max)
            }
            StorageError::IndexNotFound(name) => write!(f, "No such index: {}", name),
            StorageError::InvalidQuery(e) => write!(f, "Invalid query: {}", e),
            StorageError::IndexingTimeout => write!(f, "Timed out waiting for indexing"),
            StorageError::Other(e) => write!(f, "Other: {}", e),
        }
    }
}
impl std::error::Error for StorageError {}
impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}
impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e.to_string())
    }
}
