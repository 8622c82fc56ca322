//! Error kinds surfaced by pipeline actions.
//! Camera and file errors are terminal to the action that raised them;
//! recognition failures additionally land in `PipelineState::Failed`.

/// Every failure a caller of the pipeline can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// The user or platform refused camera access.
    PermissionDenied,
    /// No camera matches the requested facing mode, or the stream died.
    DeviceUnavailable,
    /// The camera is held exclusively elsewhere.
    DeviceBusy,
    /// Unsupported upload type, unreadable file, or no image to recognize.
    InvalidInput(String),
    /// A recognition job is already running.
    Busy,
    /// The engine reported a failure; carries its diagnostic text.
    RecognitionFailed(String),
    /// Configuration could not be loaded or is invalid.
    Config(String),
}

impl ScanError {
    /// Short stable identifier, used in logs and serialized snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::PermissionDenied => "permission_denied",
            ScanError::DeviceUnavailable => "device_unavailable",
            ScanError::DeviceBusy => "device_busy",
            ScanError::InvalidInput(_) => "invalid_input",
            ScanError::Busy => "busy",
            ScanError::RecognitionFailed(_) => "recognition_failed",
            ScanError::Config(_) => "config",
        }
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::PermissionDenied => write!(f, "camera permission denied"),
            ScanError::DeviceUnavailable => write!(f, "no camera available"),
            ScanError::DeviceBusy => write!(f, "camera is in use by another application"),
            ScanError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ScanError::Busy => {
                write!(f, "cannot start a second recognition while one is running")
            }
            ScanError::RecognitionFailed(msg) => write!(f, "recognition failed: {msg}"),
            ScanError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for ScanError {}

impl From<image::ImageError> for ScanError {
    fn from(e: image::ImageError) -> Self {
        ScanError::InvalidInput(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_message_is_caller_visible() {
        assert_eq!(
            ScanError::Busy.to_string(),
            "cannot start a second recognition while one is running"
        );
    }

    #[test]
    fn test_kind_identifiers() {
        assert_eq!(ScanError::PermissionDenied.kind(), "permission_denied");
        assert_eq!(ScanError::InvalidInput("x".into()).kind(), "invalid_input");
        assert_eq!(
            ScanError::RecognitionFailed("boom".into()).kind(),
            "recognition_failed"
        );
    }
}
