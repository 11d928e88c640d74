use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("negotiation with {user_id} failed: {reason}")]
    NegotiationFailed { user_id: String, reason: String },

    #[error("no connection to {0}")]
    UnknownPeer(String),

    #[error("connection to {0} failed")]
    TransportFailed(String),

    #[error("connection to {0} was not established in time")]
    NegotiationTimeout(String),

    #[error("could not attach local audio for {user_id}: {reason}")]
    Track { user_id: String, reason: String },
}

impl MeshError {
    /// The remote participant this error is about.
    pub fn user_id(&self) -> &str {
        match self {
            Self::NegotiationFailed { user_id, .. } | Self::Track { user_id, .. } => user_id,
            Self::UnknownPeer(id) | Self::TransportFailed(id) | Self::NegotiationTimeout(id) => id,
        }
    }
}
