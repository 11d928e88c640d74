use thiserror::Error;

use crate::{audio::AudioError, mesh::MeshError, signaling::SignalingError};

/// Anything a session can report to its caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("microphone: {0}")]
    Audio(#[from] AudioError),

    #[error("signaling: {0}")]
    Signaling(#[from] SignalingError),

    #[error("peer connection: {0}")]
    Mesh(#[from] MeshError),

    #[error("not in a space")]
    NotJoined,

    #[error("already in space {0}; leave it first")]
    AlreadyJoined(String),
}

impl SessionError {
    /// Whole-session errors need the caller to act (rejoin, grant access).
    /// Mesh errors are contained to one peer.
    pub fn is_session_level(&self) -> bool {
        !matches!(self, Self::Mesh(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_and_mesh_errors_are_distinct() {
        let signaling = SessionError::from(SignalingError::ConnectionLost);
        let mesh = SessionError::from(MeshError::TransportFailed("bob".into()));
        assert_ne!(signaling.to_string(), mesh.to_string());
        assert!(signaling.is_session_level());
        assert!(!mesh.is_session_level());
    }
}
