//! Error types for the filter framework.

use thiserror::Error;

/// Result type alias for filter operations.
pub type FilterResult<T> = Result<T, FilterError>;

/// Error variants for filter operations.
///
/// Errors double as transaction status, so they are `Clone` and comparable:
/// a cloned transaction's final status is copied back onto the external
/// transaction it was made from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// A transaction or call carried misaligned or out-of-bounds arguments.
    #[error("Invalid arguments: {reason}")]
    InvalidArgs {
        /// Description of what was wrong.
        reason: String,
    },

    /// An allocation failed, even after an opportunistic bitmap compression.
    #[error("Out of memory")]
    NoMemory,

    /// A fixed pool was exhausted, e.g. every cache entry is pinned.
    #[error("No resources: {reason}")]
    NoResources {
        /// Description of the exhausted resource.
        reason: String,
    },

    /// The device is stopping or exiting and no longer accepts work.
    #[error("Handle closed")]
    HandleClosed,

    /// The underlying device reported a data or transfer error.
    #[error("I/O error: {reason}")]
    Io {
        /// Description of the error.
        reason: String,
    },

    /// The operation is not handled at this layer.
    #[error("Not supported: {reason}")]
    NotSupported {
        /// Description of the unsupported operation.
        reason: String,
    },

    /// An output buffer was too small for the reply.
    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes provided.
        actual: usize,
    },
}

impl FilterError {
    /// Shorthand for [`FilterError::InvalidArgs`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        FilterError::InvalidArgs {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`FilterError::Io`].
    pub fn io(reason: impl Into<String>) -> Self {
        FilterError::Io {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`FilterError::NotSupported`].
    pub fn not_supported(reason: impl Into<String>) -> Self {
        FilterError::NotSupported {
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for FilterError {
    fn from(err: std::io::Error) -> Self {
        FilterError::Io {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_result_alias() {
        let ok: FilterResult<u64> = Ok(7);
        assert!(ok.is_ok());

        let err: FilterResult<u64> = Err(FilterError::HandleClosed);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read");
        let err: FilterError = std_err.into();
        assert!(matches!(err, FilterError::Io { .. }));
        assert!(format!("{}", err).contains("short read"));
    }

    #[test]
    fn test_invalid_args_message() {
        let err = FilterError::invalid("offset 100 is not block aligned");
        assert_eq!(
            format!("{}", err),
            "Invalid arguments: offset 100 is not block aligned"
        );
    }

    #[test]
    fn test_buffer_too_small() {
        let err = FilterError::BufferTooSmall {
            needed: 8,
            actual: 4,
        };
        assert_eq!(format!("{}", err), "Buffer too small: need 8 bytes, got 4");
    }

    #[test]
    fn test_status_is_cloneable() {
        let status: FilterResult<()> = Err(FilterError::io("media error"));
        let copied = status.clone();
        assert_eq!(status, copied);
    }

    #[test]
    fn test_handle_closed() {
        assert_eq!(format!("{}", FilterError::HandleClosed), "Handle closed");
    }
}
