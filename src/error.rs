use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Hashing error: {0}")]
    Hashing(String),

    #[error("Memory quota exceeded: {0}")]
    Quota(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Clone for CacheError {
    fn clone(&self) -> Self {
        match self {
            CacheError::Io(e) => CacheError::Network(e.to_string()),
            CacheError::Protocol(s) => CacheError::Protocol(s.clone()),
            CacheError::Auth(s) => CacheError::Auth(s.clone()),
            CacheError::Configuration(s) => CacheError::Configuration(s.clone()),
            CacheError::Compression(s) => CacheError::Compression(s.clone()),
            CacheError::Hashing(s) => CacheError::Hashing(s.clone()),
            CacheError::Quota(s) => CacheError::Quota(s.clone()),
            CacheError::NotFound(s) => CacheError::NotFound(s.clone()),
            CacheError::InvalidArgument(s) => CacheError::InvalidArgument(s.clone()),
            CacheError::Network(s) => CacheError::Network(s.clone()),
            CacheError::Queue(s) => CacheError::Queue(s.clone()),
            CacheError::Server(s) => CacheError::Server(s.clone()),
            CacheError::Internal(s) => CacheError::Internal(s.clone()),
        }
    }
}

impl PartialEq for CacheError {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
