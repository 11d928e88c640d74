use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("microphone access was denied; allow microphone access in your system settings")]
    PermissionDenied,

    #[error("input device not found: {0}")]
    DeviceNotFound(String),

    #[error("input device is busy or in use by another application: {0}")]
    DeviceBusy(String),

    #[error("input device does not support the requested capture settings: {0}")]
    ConstraintsUnsupported(String),

    #[error("microphone stopped unexpectedly; rejoin audio to continue speaking")]
    TrackEnded,

    #[error("no active microphone stream")]
    NoActiveStream,

    #[error("audio backend error: {0}")]
    Backend(String),
}

impl AudioError {
    /// Map a free-form host error onto the closest user-actionable variant.
    pub(crate) fn classify(description: impl Into<String>) -> Self {
        let description = description.into();
        let lower = description.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
            Self::PermissionDenied
        } else if lower.contains("busy") || lower.contains("in use") || lower.contains("exclusive") {
            Self::DeviceBusy(description)
        } else {
            Self::Backend(description)
        }
    }
}
