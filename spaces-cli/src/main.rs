mod bridge;
mod console;

use std::sync::Arc;

use anyhow::{bail, Context};
use spaces_core::{
    audio::{AudioOutput, CpalCapture, DeafenFlag},
    mesh::RtcTransportFactory,
    LocalIdentity, MediaStack, Orchestrator, Role, SpacesConfig,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "spaces=info,spaces_core=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let space = match std::env::args().nth(1) {
        Some(space) => space,
        None => std::env::var("SPACES_SPACE")
            .context("usage: spaces <space-id> (or set SPACES_SPACE)")?,
    };
    let user_id = std::env::var("SPACES_USER").context("SPACES_USER is not set")?;
    let token = std::env::var("SPACES_TOKEN").unwrap_or_default();
    let role = match std::env::var("SPACES_ROLE") {
        Ok(value) => match console::parse_role(&value) {
            Some(role) => role,
            None => bail!("unknown SPACES_ROLE `{value}`"),
        },
        Err(_) => Role::Speaker,
    };

    let deafen = DeafenFlag::default();
    let output = match AudioOutput::new(deafen.clone()) {
        Ok(output) => Some(Arc::new(output)),
        Err(e) => {
            warn!("no audio output, remote audio will not play: {e}");
            None
        }
    };
    let media = MediaStack {
        capture: Arc::new(CpalCapture),
        transports: Arc::new(RtcTransportFactory::new(output)),
        deafen,
    };

    let config = SpacesConfig::from_env();
    info!(relay = %config.relay_url, %space, %user_id, "starting");

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut spaces = Orchestrator::new(config, LocalIdentity { user_id, role, token }, media, event_tx);

    spaces
        .join(&space)
        .await
        .with_context(|| format!("could not join {space}"))?;
    println!("joined {space} (muted). type `help` for commands");

    bridge::run(&mut spaces, event_rx).await;
    Ok(())
}
