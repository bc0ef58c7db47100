//! Error types for Basalt

/// Result type alias for Basalt operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Basalt
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Object store errors that carry no special meaning for the lifecycle core
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    /// Key does not exist in the bucket
    #[error("object not found: {key}")]
    NotFound { key: String },
    /// Access to a key was denied (e.g. customer-managed encryption key revoked)
    #[error("access denied: {key}")]
    AccessDenied { key: String },
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
    /// Bucket index is missing or unparseable
    #[error("bucket index not found")]
    IndexNotFound,
    /// KV store compare-and-swap failure
    #[error("ring conflict: concurrent modification detected")]
    Conflict,
    /// Too many retries
    #[error("too many retries: operation failed after maximum retry attempts")]
    TooManyRetries,
    /// Timeout
    #[error("operation timed out")]
    Timeout,
    /// Instance is not registered in the ring
    #[error("instance {instance_id} not found in the ring")]
    InstanceNotFound { instance_id: String },
    /// A visit marker is held by another instance
    #[error("visit marker held by {owner}")]
    MarkerHeld { owner: String },
    /// A monitored resource is above its rejection threshold
    #[error("resource limit reached: {resource} utilization {utilization:.2} above limit {limit:.2}")]
    ResourceLimitReached {
        resource: &'static str,
        utilization: f64,
        limit: f64,
    },
    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors meaning "the object does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// True for errors meaning "access to the object was denied".
    ///
    /// Access denied is never treated as transient: it quarantines the tenant
    /// from queries via the sync status instead of failing the cleanup pass.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Error::AccessDenied { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
