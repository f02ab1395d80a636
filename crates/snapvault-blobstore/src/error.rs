//! Blob store error types.

/// Errors from a [`BlobStore`](crate::BlobStore).
#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    /// The blob does not exist.
    #[error("blob not found: {name}")]
    NotFound { name: String },

    /// A create-if-absent write found an existing blob.
    #[error("blob already exists: {name}")]
    AlreadyExists { name: String },

    /// The blob name is empty, absolute, or escapes the store root.
    #[error("invalid blob name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Underlying I/O failure, including injected ones.
    #[error("I/O error on blob {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl BlobStoreError {
    pub fn io(name: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            name: name.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the I/O error behind this failure, if any.
    pub fn io_source(&self) -> Option<&std::io::Error> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;
