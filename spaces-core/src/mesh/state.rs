use super::transport::TransportState;

/// Lifecycle of one mesh entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerState {
    /// Transport built, nothing sent yet.
    Connecting,
    /// Our offer or answer is out; waiting for ICE/DTLS.
    Negotiating,
    Connected,
    Failed,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerSignal {
    /// The local description was sent to the remote side.
    Negotiated,
    Transport(TransportState),
}

impl PeerState {
    pub fn on(self, signal: PeerSignal) -> PeerState {
        use PeerState::*;
        match (self, signal) {
            (Closed, _) => Closed,
            (Failed, _) => Failed,
            (Connecting, PeerSignal::Negotiated) => Negotiating,
            (state, PeerSignal::Negotiated) => state,
            (_, PeerSignal::Transport(TransportState::Connected)) => Connected,
            (_, PeerSignal::Transport(TransportState::Disconnected | TransportState::Failed)) => Failed,
            (_, PeerSignal::Transport(TransportState::Closed)) => Closed,
            (state, PeerSignal::Transport(TransportState::New | TransportState::Connecting)) => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        let state = PeerState::Connecting
            .on(PeerSignal::Negotiated)
            .on(PeerSignal::Transport(TransportState::Connecting))
            .on(PeerSignal::Transport(TransportState::Connected));
        assert_eq!(state, PeerState::Connected);
    }

    #[test]
    fn disconnect_is_terminal_failure() {
        let state = PeerState::Connected.on(PeerSignal::Transport(TransportState::Disconnected));
        assert_eq!(state, PeerState::Failed);
        // A late "connected" does not resurrect a failed entry.
        assert_eq!(state.on(PeerSignal::Transport(TransportState::Connected)), PeerState::Failed);
    }

    #[test]
    fn transport_close_is_final() {
        for state in [PeerState::Connecting, PeerState::Negotiating, PeerState::Connected] {
            assert_eq!(state.on(PeerSignal::Transport(TransportState::Closed)), PeerState::Closed);
        }
        let closed = PeerState::Closed;
        assert_eq!(closed.on(PeerSignal::Negotiated), PeerState::Closed);
        assert_eq!(closed.on(PeerSignal::Transport(TransportState::Connected)), PeerState::Closed);
    }

    #[test]
    fn renegotiation_keeps_connected() {
        assert_eq!(PeerState::Connected.on(PeerSignal::Negotiated), PeerState::Connected);
    }
}
