use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("could not reach the signaling relay: {0}")]
    ConnectFailed(String),

    #[error("signaling transport error: {0}")]
    Transport(String),

    #[error("signaling relay closed the connection")]
    ConnectionLost,
}
