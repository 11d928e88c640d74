/// Glue between stdin, the orchestrator and session events.
use spaces_core::{Orchestrator, SessionEvent};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::debug;

use crate::console::{self, ConsoleCommand};

pub async fn run(spaces: &mut Orchestrator, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // EOF or a broken stdin both mean nobody is driving us.
                    Ok(None) | Err(_) => break,
                };
                match console::parse(&line) {
                    Ok(ConsoleCommand::Leave) => break,
                    Ok(cmd) => execute(spaces, cmd).await,
                    Err(console::ParseError::Empty) => {}
                    Err(e) => println!("{e}"),
                }
            }
            Some(event) = events.recv() => {
                if !print_event(event) {
                    // The session ended on its own.
                    return;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    spaces.leave().await;
    while let Ok(event) = events.try_recv() {
        print_event(event);
    }
}

async fn execute(spaces: &Orchestrator, cmd: ConsoleCommand) {
    match cmd {
        ConsoleCommand::Mute => match spaces.toggle_mute().await {
            Ok(muted) => println!("{}", if muted { "muted" } else { "live" }),
            Err(e) => println!("mute failed: {e}"),
        },
        ConsoleCommand::Deafen => match spaces.toggle_deafen().await {
            Ok(deafened) => println!("{}", if deafened { "deafened" } else { "listening" }),
            Err(e) => println!("deafen failed: {e}"),
        },
        ConsoleCommand::Device(id) => match spaces.switch_device(&id).await {
            Ok(()) => println!("switched to {id}"),
            Err(e) => println!("device switch failed: {e}"),
        },
        ConsoleCommand::Devices => match spaces.list_devices() {
            Ok(devices) => {
                let current = spaces.snapshot().device_id;
                for d in devices {
                    let marker = if current.as_deref() == Some(d.id.as_str()) { "*" } else { " " };
                    let default = if d.is_default { " (default)" } else { "" };
                    println!("{marker} {}{default}", d.name);
                }
            }
            Err(e) => println!("could not list devices: {e}"),
        },
        ConsoleCommand::Roster => {
            let roster = spaces.roster();
            if roster.is_empty() {
                println!("nobody else is here");
            }
            for p in roster {
                println!("  {} ({:?})", p.user_id, p.role);
            }
        }
        ConsoleCommand::Peers => {
            let snapshot = spaces.snapshot();
            if snapshot.peers.is_empty() {
                println!("no peer connections");
            }
            for peer in snapshot.peers {
                let audio = if peer.remote_stream.is_some() { ", audio" } else { "" };
                println!("  {}: {:?}{audio}", peer.user_id, peer.state);
            }
        }
        ConsoleCommand::Level => println!("level {}", *spaces.watch_level().borrow()),
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Leave => {}
    }
}

/// Returns false once the session has reported `Left`.
fn print_event(event: SessionEvent) -> bool {
    match event {
        SessionEvent::RosterChanged(roster) => {
            let ids: Vec<_> = roster.iter().map(|p| p.user_id.as_str()).collect();
            println!("roster: {}", if ids.is_empty() { "(empty)".into() } else { ids.join(", ") });
        }
        SessionEvent::MuteChanged(muted) => debug!(muted, "mute changed"),
        SessionEvent::DeafenChanged(deafened) => debug!(deafened, "deafen changed"),
        SessionEvent::HardwareMuteChanged(true) => println!("microphone muted by hardware"),
        SessionEvent::HardwareMuteChanged(false) => println!("hardware mute released"),
        SessionEvent::ConnectionStateChanged(state) => println!("relay: {state:?}"),
        SessionEvent::PeerConnected(user_id) => println!("connected to {user_id}"),
        SessionEvent::RemoteStream { user_id, .. } => println!("hearing {user_id}"),
        SessionEvent::PeerFailed { user_id, error } => println!("lost {user_id}: {error}"),
        SessionEvent::Error(e) => println!("error: {e}"),
        SessionEvent::Left => {
            println!("left the space");
            return false;
        }
    }
    true
}
