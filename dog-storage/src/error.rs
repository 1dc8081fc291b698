use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed cause carried by transfer failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors returned by the storage façade.
///
/// Callers only ever need to match on these variants; backend-specific error
/// shapes stay behind [`StorageError::Transfer`]'s `source`.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {container}/{key}")]
    NotFound { container: String, key: String },

    #[error("Failed to read object header for content-type detection: {source}")]
    SniffRead {
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} failed for {container}/{key}: {message}{}", code_suffix(.code))]
    Transfer {
        operation: Operation,
        container: String,
        key: String,
        code: Option<String>,
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("Invalid storage configuration: {message}")]
    InvalidConfig { message: String },
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" (code: {c})"))
        .unwrap_or_default()
}

/// The façade or pipeline step a failure occurred in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Save,
    Open,
    Download,
    Exists,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Save => "save",
            Self::Open => "open",
            Self::Download => "download",
            Self::Exists => "exists",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Marker cause for calls aborted by cancellation or deadline expiry
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Pipeline failures that did not come from the backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("object needs more than {max_parts} parts; raise the part size")]
    TooManyParts { max_parts: u32 },

    #[error("range {start}-{end} returned {received} bytes")]
    ShortRead { start: u64, end: u64, received: u64 },
}

impl StorageError {
    /// Create a not found error
    pub fn not_found<C: Into<String>, K: Into<String>>(container: C, key: K) -> Self {
        Self::NotFound {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Wrap a non-backend failure (stream, sink, cancellation) as a transfer failure
    pub fn transfer<E>(operation: Operation, container: &str, key: &str, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transfer {
            operation,
            container: container.to_string(),
            key: key.to_string(),
            code: None,
            message: error.to_string(),
            source: Box::new(error),
        }
    }

    /// Transfer failure caused by cancellation or an expired deadline
    pub fn cancelled(operation: Operation, container: &str, key: &str) -> Self {
        Self::transfer(operation, container, key, Cancelled)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the call was aborted by its context rather than by the backend
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Transfer { source, .. } => source.is::<Cancelled>(),
            _ => false,
        }
    }

    /// Backend diagnostic code, when the failure came from the backend
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transfer { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_display_includes_code_when_present() {
        let err = StorageError::Transfer {
            operation: Operation::Save,
            container: "media".to_string(),
            key: "a/b.txt".to_string(),
            code: Some("AccessDenied".to_string()),
            message: "Access Denied".to_string(),
            source: Box::new(std::io::Error::other("denied")),
        };

        assert_eq!(
            err.to_string(),
            "save failed for media/a/b.txt: Access Denied (code: AccessDenied)"
        );
        assert_eq!(err.code(), Some("AccessDenied"));
    }

    #[test]
    fn cancellation_is_recognizable() {
        let err = StorageError::cancelled(Operation::Download, "media", "clip.mp4");
        assert!(err.is_cancelled());
        assert!(!err.is_not_found());
        assert_eq!(err.code(), None);

        let other = StorageError::transfer(
            Operation::Download,
            "media",
            "clip.mp4",
            std::io::Error::other("disk full"),
        );
        assert!(!other.is_cancelled());
    }

    #[test]
    fn source_is_preserved() {
        use std::error::Error as _;

        let err = StorageError::transfer(
            Operation::Open,
            "media",
            "k",
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
        );
        let source = err.source().expect("source kept");
        let io = source.downcast_ref::<std::io::Error>().expect("io error");
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionReset);
    }
}
