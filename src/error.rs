//! Error types for rootsmith
//!
//! All modules use `RootsmithResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for rootsmith operations
pub type RootsmithResult<T> = Result<T, RootsmithError>;

/// All errors that can occur in rootsmith
#[derive(Error, Debug)]
pub enum RootsmithError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Missing environment variables: {}", .0.join(", "))]
    ConfigMissing(Vec<String>),

    #[error("Invalid value for {key}: {reason}")]
    ConfigValue { key: String, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Registry authentication errors
    #[error("AWS credentials not configured. Run: aws configure")]
    AwsNotConfigured,

    #[error("Registry authentication failed: {0}")]
    RegistryAuth(String),

    // Image fetch errors
    #[error("Invalid image reference {image}: {reason}")]
    InvalidImageRef { image: String, reason: String },

    #[error("Image pull failed: {image}: {reason}")]
    ImagePull { image: String, reason: String },

    #[error("Image pull timed out after {secs}s: {image}")]
    FetchTimeout { image: String, secs: u64 },

    #[error("Failed to determine size of {image}: {reason}")]
    ImageSize { image: String, reason: String },

    // Conversion errors
    #[error("Build failed - exceeded maximum size {limit_mb} MB")]
    SizeExceeded { limit_mb: u64 },

    #[error("Failed to extract layer: {reason}")]
    LayerExtraction { reason: String },

    #[error("Error converting image to ext4: {0}")]
    Conversion(String),

    // Diff cache errors
    #[error("Failed to initialize diff {key}: {reason}")]
    DiffInit { key: String, reason: String },

    #[error("Diff {0} is closed")]
    DiffClosed(String),

    // Object storage errors
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Storage error for {key}: {reason}")]
    Storage { key: String, reason: String },

    // Build lifecycle errors
    #[error("Service is draining, not accepting new builds")]
    Draining,

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Build already running: {0}")]
    BuildExists(String),

    #[error("Build {id} failed: {reason}")]
    BuildFailed { id: String, reason: String },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RootsmithError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a storage error for an object key
    pub fn storage(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Storage {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a size-exceeded error from a byte limit
    pub fn size_exceeded(limit_bytes: u64) -> Self {
        Self::SizeExceeded {
            limit_mb: limit_bytes >> 20,
        }
    }

    /// Check if error is a transient external failure.
    ///
    /// Nothing inside the crate retries on this; it only informs callers.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ImagePull { .. } | Self::FetchTimeout { .. } | Self::Storage { .. }
        )
    }

    /// Whether the error is a user-facing resource limit rather than an internal failure
    pub fn is_size_limit(&self) -> bool {
        matches!(self, Self::SizeExceeded { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::AwsNotConfigured => Some("Run: aws configure"),
            Self::ConfigMissing(_) => Some("Set the variables or fill the [registry] section"),
            Self::SizeExceeded { .. } => Some("Use a smaller base image or raise --max-size-mb"),
            Self::Draining => Some("Retry the build on another instance"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_exceeded_reports_megabytes() {
        let err = RootsmithError::size_exceeded(512 << 20);
        assert_eq!(
            err.to_string(),
            "Build failed - exceeded maximum size 512 MB"
        );
        assert!(err.is_size_limit());
    }

    #[test]
    fn config_missing_lists_all() {
        let err = RootsmithError::ConfigMissing(vec![
            "AWS_ACCOUNT_ID".to_string(),
            "AWS_REGION".to_string(),
        ]);
        assert!(err.to_string().contains("AWS_ACCOUNT_ID, AWS_REGION"));
    }

    #[test]
    fn error_hint() {
        assert_eq!(
            RootsmithError::AwsNotConfigured.hint(),
            Some("Run: aws configure")
        );
        assert!(RootsmithError::Internal("x".into()).hint().is_none());
    }

    #[test]
    fn error_retryable() {
        assert!(RootsmithError::FetchTimeout {
            image: "nginx".into(),
            secs: 5
        }
        .is_retryable());
        assert!(!RootsmithError::Draining.is_retryable());
        assert!(!RootsmithError::size_exceeded(1 << 20).is_retryable());
    }
}
