//! Error types for the Smart Drive Agent
//!
//! Provides structured error types for every agent component: the uevent
//! wire decoder and listener, the device prober, the initialization
//! pipeline, the capacity ledger and the cluster object stores.

use std::time::Duration;
use thiserror::Error;

/// Stage of the single-device initialization pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    MountCheck,
    Format,
    Mount,
    RegisterMetadata,
    CreateDrive,
}

impl std::fmt::Display for InitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitStage::MountCheck => write!(f, "mount-check"),
            InitStage::Format => write!(f, "format"),
            InitStage::Mount => write!(f, "mount"),
            InitStage::RegisterMetadata => write!(f, "register-metadata"),
            InitStage::CreateDrive => write!(f, "create-drive"),
        }
    }
}

/// Unified error type for the agent
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    // =========================================================================
    // Uevent Wire Errors
    // =========================================================================
    #[error("malformed uevent signature")]
    MalformedSignature,

    #[error("uevent magic mismatch: expected {expected:#x}, got {got:#x}")]
    MagicMismatch { expected: u32, got: u32 },

    #[error("invalid uevent payload offset {offset} for message of {len} bytes")]
    InvalidOffset { offset: usize, len: usize },

    #[error("short read: expected {expected} bytes, read {got}")]
    ShortRead { expected: usize, got: usize },

    #[error("empty uevent buffer")]
    EmptyBuffer,

    // =========================================================================
    // Uevent Validation Errors
    // =========================================================================
    #[error("not a block device event")]
    NonDeviceEvent,

    #[error("invalid device event: {0}")]
    InvalidEvent(String),

    #[error("unable to convert {field}={value:?}")]
    FieldConversion { field: String, value: String },

    // =========================================================================
    // Listener Control
    // =========================================================================
    #[error("operation cancelled")]
    Cancelled,

    #[error("listener closed")]
    ListenerClosed,

    // =========================================================================
    // Device / Host Errors
    // =========================================================================
    #[error("Hardware discovery failed: {0}")]
    HardwareDiscovery(String),

    #[error("Device not found: {device}")]
    DeviceNotFound { device: String },

    #[error("filesystem not found on {device}")]
    FilesystemNotFound { device: String },

    #[error("corrupt XFS superblock on {device}: {reason}")]
    CorruptSuperblock { device: String, reason: String },

    #[error("device {device} mounted at {mount_points}")]
    DeviceMounted { device: String, mount_points: String },

    #[error("{operation} {target} failed: {reason}")]
    HostOperation {
        operation: String,
        target: String,
        reason: String,
    },

    // =========================================================================
    // Initialization Pipeline Errors
    // =========================================================================
    #[error("{stage} of {device} failed: {source}")]
    InitFailed {
        device: String,
        stage: InitStage,
        #[source]
        source: Box<Error>,
    },

    /// Compensating action failed after the original error
    #[error("{original}; {cleanup}")]
    Compensation {
        original: Box<Error>,
        cleanup: Box<Error>,
    },

    // =========================================================================
    // Matching Errors
    // =========================================================================
    #[error("device {device} matches {count} drives")]
    AmbiguousMatch { device: String, count: usize },

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflict updating {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("watch stream error: {0}")]
    Watch(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Nix(#[from] nix::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Wrap this error with the initialization stage and device it failed on
    pub fn at_stage(self, stage: InitStage, device: impl Into<String>) -> Self {
        Error::InitFailed {
            device: device.into(),
            stage,
            source: Box::new(self),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::Conflict { .. } | Error::Watch(_) | Error::Io(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Wait for the host to settle
            Error::DeviceMounted { .. } | Error::DeviceNotFound { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(30))
            }

            // Needs an administrator
            Error::AmbiguousMatch { .. } => ErrorAction::NoRequeue,

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::NonDeviceEvent
            | Error::InvalidEvent(_)
            | Error::FieldConversion { .. }
            | Error::ResourceNotFound { .. }
            | Error::ResourceExists { .. }
            | Error::Cancelled
            | Error::ListenerClosed => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_) | Error::Conflict { .. } | Error::Watch(_)
        )
    }

    /// Optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ResourceNotFound { .. })
    }

    /// Framing errors desynchronize the socket and end the listener loop
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Error::MalformedSignature
                | Error::MagicMismatch { .. }
                | Error::InvalidOffset { .. }
                | Error::ShortRead { .. }
                | Error::EmptyBuffer
        )
    }
}

/// Result type alias for the agent
pub type Result<T> = std::result::Result<T, Error>;

/// Map a "not found" result to `Ok(None)`
pub fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::DeviceMounted {
            device: "/dev/sdb".into(),
            mount_points: "/mnt".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::AmbiguousMatch {
            device: "sdb".into(),
            count: 2,
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::Conflict {
            kind: "Drive".into(),
            name: "d1".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());
        assert!(transient.is_conflict());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_stage_wrapping_keeps_source() {
        let err = Error::HostOperation {
            operation: "mount".into(),
            target: "/dev/sdb".into(),
            reason: "EBUSY".into(),
        }
        .at_stage(InitStage::Mount, "/dev/sdb");

        assert_eq!(
            err.to_string(),
            "mount of /dev/sdb failed: mount /dev/sdb failed: EBUSY"
        );
    }

    #[test]
    fn test_compensation_appends_cleanup() {
        let err = Error::Compensation {
            original: Box::new(Error::Internal("write failed".into())),
            cleanup: Box::new(Error::Internal("umount failed".into())),
        };
        assert_eq!(
            err.to_string(),
            "Internal error: write failed; Internal error: umount failed"
        );
    }

    #[test]
    fn test_ignore_not_found() {
        let missing: Result<u32> = Err(Error::ResourceNotFound {
            kind: "Volume".into(),
            name: "v1".into(),
        });
        assert!(matches!(ignore_not_found(missing), Ok(None)));
        assert!(matches!(ignore_not_found(Ok(3u32)), Ok(Some(3))));
        assert!(ignore_not_found::<u32>(Err(Error::Internal("x".into()))).is_err());
    }
}
