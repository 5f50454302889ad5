use std::io;
use thiserror::Error;

/// Error types for sealpack operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Key is not exactly 256 bits
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A stream stage could not be constructed
    #[error("Acquisition error: {0}")]
    Acquisition(String),

    /// File and stream I/O errors, including unparseable context headers
    #[error("I/O error: {0}")]
    Io(String),

    /// Structurally valid input carrying an unacceptable value
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A frame did not authenticate (wrong key or tampered data)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed stream or archive layout
    #[error("Format error: {0}")]
    Format(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    pub fn acquisition(msg: impl Into<String>) -> Self {
        Self::Acquisition(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        // Stages raise typed errors through Read/Write; recover them here.
        if err.get_ref().is_some_and(|inner| inner.is::<ArchiveError>()) {
            if let Some(Ok(typed)) = err.into_inner().map(|inner| inner.downcast::<ArchiveError>()) {
                return *typed;
            }
            return Self::Io("stream stage failed".to_string());
        }
        Self::Io(err.to_string())
    }
}

impl From<ArchiveError> for io::Error {
    fn from(err: ArchiveError) -> Self {
        let kind = match err {
            ArchiveError::Authentication(_) | ArchiveError::Format(_) => io::ErrorKind::InvalidData,
            ArchiveError::InvalidValue(_) | ArchiveError::InvalidKey(_) => {
                io::ErrorKind::InvalidInput
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_error_survives_io_round_trip() {
        let io_err: io::Error = ArchiveError::authentication("frame 3").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        match ArchiveError::from(io_err) {
            ArchiveError::Authentication(msg) => assert_eq!(msg, "frame 3"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn plain_io_error_maps_to_io() {
        let err = ArchiveError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(matches!(err, ArchiveError::Io(_)));
    }
}
