// Runtime configuration for a Spaces session.
//
// Everything has a usable default; `from_env` overrides individual fields
// from SPACES_* environment variables.

use std::time::Duration;

use crate::signaling::ReconnectPolicy;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8787/signal";

/// Two independent public STUN servers. No TURN: peers behind symmetric
/// NATs will fail ICE and surface `MeshError::TransportFailed`.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Who sends the offer when two participants learn about each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitiatorPolicy {
    /// The participant with the lexicographically smaller id always offers.
    LowestId,
    /// Offer whenever a `user-joined` arrives and a local capture is running.
    /// Both sides may offer at once; kept for compatibility with older clients.
    OnJoinNotice,
}

impl InitiatorPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "lowest-id" => Some(Self::LowestId),
            "on-join" => Some(Self::OnJoinNotice),
            _ => None,
        }
    }
}

/// Capture processing requested from the input device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpacesConfig {
    /// Base WebSocket URL of the signaling relay.
    pub relay_url: String,
    pub ice_servers: Vec<String>,
    /// Input device name; `None` uses the host default.
    pub input_device: Option<String>,
    pub constraints: AudioConstraints,
    /// How often the input level is sampled.
    pub level_interval: Duration,
    pub negotiation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub initiator: InitiatorPolicy,
    /// Consecutive rebuilds of one failed peer entry before giving up.
    pub max_peer_rebuilds: u32,
}

impl Default for SpacesConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_owned(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            input_device: None,
            constraints: AudioConstraints::default(),
            level_interval: Duration::from_millis(100),
            negotiation_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            initiator: InitiatorPolicy::LowestId,
            max_peer_rebuilds: 2,
        }
    }
}

impl SpacesConfig {
    /// Build a config from `SPACES_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("SPACES_RELAY_URL") {
            config.relay_url = url;
        }
        if let Some(list) = lookup("SPACES_STUN") {
            let servers: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
            // Keep redundancy: a single STUN server is not enough.
            if servers.len() >= 2 {
                config.ice_servers = servers;
            } else {
                tracing::warn!("SPACES_STUN needs at least two servers, using defaults");
            }
        }
        config.input_device = lookup("SPACES_INPUT_DEVICE").filter(|d| !d.is_empty());

        if let Some(secs) = lookup("SPACES_NEGOTIATION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.negotiation_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = lookup("SPACES_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            config.reconnect.max_attempts = attempts;
        }
        if let Some(policy) = lookup("SPACES_INITIATOR") {
            match InitiatorPolicy::parse(&policy) {
                Some(p) => config.initiator = p,
                None => tracing::warn!("unknown SPACES_INITIATOR {policy:?}, using lowest-id"),
            }
        }
        if let Some(n) = lookup("SPACES_PEER_REBUILDS").and_then(|v| v.parse().ok()) {
            config.max_peer_rebuilds = n;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> SpacesConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SpacesConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_use_two_stun_servers() {
        let config = SpacesConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.initiator, InitiatorPolicy::LowestId);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(30));
    }

    #[test]
    fn env_overrides_fields() {
        let config = config_from(&[
            ("SPACES_RELAY_URL", "wss://relay.example/ws"),
            ("SPACES_INPUT_DEVICE", "USB Mic"),
            ("SPACES_RECONNECT_ATTEMPTS", "0"),
            ("SPACES_INITIATOR", "on-join"),
            ("SPACES_NEGOTIATION_TIMEOUT_SECS", "12"),
        ]);
        assert_eq!(config.relay_url, "wss://relay.example/ws");
        assert_eq!(config.input_device.as_deref(), Some("USB Mic"));
        assert_eq!(config.reconnect.max_attempts, 0);
        assert_eq!(config.initiator, InitiatorPolicy::OnJoinNotice);
        assert_eq!(config.negotiation_timeout, Duration::from_secs(12));
    }

    #[test]
    fn single_stun_server_falls_back_to_defaults() {
        let config = config_from(&[("SPACES_STUN", "stun:only.example:3478")]);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0], DEFAULT_STUN_SERVERS[0]);

        let config = config_from(&[("SPACES_STUN", "stun:a:1, stun:b:2 ,stun:c:3")]);
        assert_eq!(config.ice_servers, vec!["stun:a:1", "stun:b:2", "stun:c:3"]);
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = config_from(&[
            ("SPACES_INITIATOR", "coin-flip"),
            ("SPACES_RECONNECT_ATTEMPTS", "lots"),
        ]);
        assert_eq!(config.initiator, InitiatorPolicy::LowestId);
        assert_eq!(config.reconnect.max_attempts, ReconnectPolicy::default().max_attempts);
    }
}
