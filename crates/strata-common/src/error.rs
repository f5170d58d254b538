use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    /// Malformed persisted data: bad sector table entry, out-of-range
    /// palette index, missing or mistyped tag. The affected chunk is
    /// treated as absent, never as a fatal region failure.
    CorruptFormat(String),
    /// Caller bug: wrong coordinate or payload handed to a region-bound
    /// operation. Fail fast, not recoverable.
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Io(err) => write!(f, "IO error: {}", err),
            StorageError::CorruptFormat(msg) => write!(f, "Corrupt format: {}", msg),
            StorageError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StorageError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: StorageError = io_err.into();
        assert_matches!(err, StorageError::Io(_));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_display() {
        let err = StorageError::CorruptFormat("palette index 9 out of bounds".to_owned());
        assert_eq!(
            format!("{}", err),
            "Corrupt format: palette index 9 out of bounds"
        );
    }
}
