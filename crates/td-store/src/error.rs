/// Failures surfaced by a store implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A row the caller required does not exist.
    NotFound { what: String },
    /// A uniqueness or CAS constraint rejected the write.
    Conflict { what: String },
    /// The backing engine failed (connection, serialization, ...).
    Backend { detail: String },
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StoreError::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        StoreError::Conflict { what: what.into() }
    }

    pub fn backend(detail: impl Into<String>) -> Self {
        StoreError::Backend {
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound { what } => write!(f, "not found: {what}"),
            StoreError::Conflict { what } => write!(f, "conflict: {what}"),
            StoreError::Backend { detail } => write!(f, "store backend error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}
