//! Minimal end-to-end audio test.
//!
//! Joins a space through the relay, unmutes the microphone, plays every
//! remote participant through the default speaker and prints session events
//! until Ctrl-C.
//!
//! Prerequisites: a signaling relay listening on SPACES_RELAY_URL.
//!
//! Run from the workspace root:
//!   cargo run -p spaces-core --example join
//!
//! Env vars (all optional, shown with defaults):
//!   SPACES_RELAY_URL  ws://localhost:8787/signal
//!   SPACES_SPACE      dev
//!   SPACES_USER       alice
//!   SPACES_TOKEN      dev-token
//!   RUST_LOG          spaces_core=debug

use std::{env, sync::Arc};

use spaces_core::{
    audio::{AudioOutput, CpalCapture, DeafenFlag},
    mesh::RtcTransportFactory,
    LocalIdentity, MediaStack, Orchestrator, Role, SessionEvent, SpacesConfig,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "spaces_core=debug".into()))
        .init();

    let space = env::var("SPACES_SPACE").unwrap_or_else(|_| "dev".into());
    let identity = LocalIdentity {
        user_id: env::var("SPACES_USER").unwrap_or_else(|_| "alice".into()),
        role: Role::Speaker,
        token: env::var("SPACES_TOKEN").unwrap_or_else(|_| "dev-token".into()),
    };

    // Speaker output is best-effort; without it we still send audio.
    let deafen = DeafenFlag::default();
    let output = match AudioOutput::new(deafen.clone()) {
        Ok(o) => Some(Arc::new(o)),
        Err(e) => {
            warn!("audio output unavailable: {e}");
            None
        }
    };
    let media = MediaStack {
        capture: Arc::new(CpalCapture),
        transports: Arc::new(RtcTransportFactory::new(output)),
        deafen,
    };

    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut spaces = Orchestrator::new(SpacesConfig::from_env(), identity, media, event_tx);

    info!("joining {space}");
    spaces.join(&space).await?;
    if let Err(e) = spaces.toggle_mute().await {
        warn!("could not unmute: {e}");
    }

    info!("in space, Ctrl-C to leave");
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                SessionEvent::RosterChanged(roster) => {
                    let ids: Vec<_> = roster.iter().map(|p| p.user_id.as_str()).collect();
                    println!("roster: {}", ids.join(", "));
                }
                SessionEvent::RemoteStream { user_id, .. } => println!("hearing {user_id}"),
                SessionEvent::Error(e) => println!("error: {e}"),
                other => println!("{other:?}"),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    spaces.leave().await;
    Ok(())
}
