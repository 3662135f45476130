//! Error taxonomy for recording operations.
//!
//! Every variant carries a stable wire code (see [`SpoolError::code`]) that
//! the dispatcher reports back to callers.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("recording already active: {0}")]
    NameInUse(String),

    #[error("recording not active: {0}")]
    NotActive(String),

    #[error("permanent storage not mounted at {}", .0.display())]
    MissingMount(PathBuf),

    #[error("failed to open recording file {}: {source}", path.display())]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("recording not found: {0}")]
    NotFound(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("corrupt record at offset {offset}: {message}")]
    Corrupt { offset: u64, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("stream source error: {0}")]
    Source(String),
}

impl SpoolError {
    /// Stable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SpoolError::Validation(_) => "validation_error",
            SpoolError::NameInUse(_) => "name_in_use",
            SpoolError::NotActive(_) => "not_active",
            SpoolError::MissingMount(_) => "missing_mount",
            SpoolError::FileOpen { .. } => "file_open_failure",
            SpoolError::NotFound(_) => "not_found",
            SpoolError::Transform(_) => "transform_error",
            SpoolError::Corrupt { .. } => "corrupt_record",
            SpoolError::Io(_) => "io_error",
            SpoolError::Source(_) => "source_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, SpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(SpoolError::NameInUse("a".into()).code(), "name_in_use");
        assert_eq!(
            SpoolError::Corrupt {
                offset: 12,
                message: "bad".into()
            }
            .code(),
            "corrupt_record"
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        assert_eq!(SpoolError::from(io).code(), "io_error");
    }

    #[test]
    fn test_missing_mount_message_names_path() {
        let err = SpoolError::MissingMount(PathBuf::from("/mnt/perm"));
        assert!(err.to_string().contains("/mnt/perm"));
    }
}
