//! Client core for Spaces: multi-party audio over a full WebRTC mesh,
//! coordinated through a WebSocket signaling relay.
//!
//! - [`audio`]: microphone capture, mute/deafen, level metering, playback.
//! - [`signaling`]: the relay connection and its wire messages.
//! - [`mesh`]: one peer connection per remote participant.
//! - [`session`]: the [`Orchestrator`] tying the three together per space.

pub mod audio;
pub mod config;
pub mod mesh;
pub mod session;
pub mod signaling;

pub use config::{InitiatorPolicy, SpacesConfig};
pub use session::{
    LocalIdentity, MediaStack, Orchestrator, Participant, SessionError, SessionEvent, SessionSnapshot,
};
pub use signaling::Role;
