/*!
 * Error types for berth
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, BerthError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_NO_TARGET: i32 = 2;
pub const EXIT_CONFLICT: i32 = 3;

#[derive(Debug)]
pub enum BerthError {
    /// Source directory not found or not a directory
    SourceMissing(PathBuf),

    /// Configuration error (unreadable file, bad TOML, invalid values)
    Config(String),

    /// I/O error
    Io(io::Error),

    /// Copy engine could not be launched
    EngineSpawn(String),

    /// Log sink could not be set up
    LogSetup(String),

    /// Single-instance lock error (not contention, which is a normal path)
    InstanceLock(String),
}

impl BerthError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            // Everything here is a category-(a) input error or a local
            // failure; resolution codes 2/3 come from sentinel resolution,
            // not from this type.
            BerthError::SourceMissing(_)
            | BerthError::Config(_)
            | BerthError::Io(_)
            | BerthError::EngineSpawn(_)
            | BerthError::LogSetup(_)
            | BerthError::InstanceLock(_) => EXIT_FAILURE,
        }
    }

    /// Check if this error is fatal at startup (input-error category)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BerthError::SourceMissing(_)
                | BerthError::Config(_)
                | BerthError::LogSetup(_)
                | BerthError::InstanceLock(_)
        )
    }
}

impl fmt::Display for BerthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BerthError::SourceMissing(path) => {
                write!(f, "Source directory not found: {}", path.display())
            }
            BerthError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BerthError::Io(err) => write!(f, "I/O error: {}", err),
            BerthError::EngineSpawn(msg) => {
                write!(f, "Failed to launch copy engine: {}", msg)
            }
            BerthError::LogSetup(msg) => write!(f, "Log setup error: {}", msg),
            BerthError::InstanceLock(msg) => {
                write!(f, "Instance lock error: {}", msg)
            }
        }
    }
}

impl std::error::Error for BerthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BerthError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BerthError {
    fn from(err: io::Error) -> Self {
        BerthError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            BerthError::SourceMissing(PathBuf::from("/nope")).exit_code(),
            EXIT_FAILURE
        );
        assert_eq!(
            BerthError::Config("bad".to_string()).exit_code(),
            EXIT_FAILURE
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BerthError::Config("bad".to_string()).is_fatal());
        assert!(BerthError::SourceMissing(PathBuf::from("/nope")).is_fatal());
        assert!(!BerthError::EngineSpawn("gone".to_string()).is_fatal());
    }

    #[test]
    fn test_display_includes_path() {
        let err = BerthError::SourceMissing(PathBuf::from("/data/photos"));
        assert!(err.to_string().contains("/data/photos"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: BerthError = io_err.into();
        assert!(matches!(err, BerthError::Io(_)));
    }
}
