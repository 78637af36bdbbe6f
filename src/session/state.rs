/// Connection lifecycle. `Closed` is terminal and reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, nothing exchanged yet
    Connected,
    /// Handshake seen, waiting for credentials to be accepted
    Authenticating,
    /// Credentials accepted, sync traffic allowed
    Ready,
    Closed,
}

impl SessionState {
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether moving to `next` is allowed. Only forward moves, and
    /// nothing leaves `Closed`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connected, Authenticating)
                | (Connected, Ready)
                | (Authenticating, Ready)
                | (Connected, Closed)
                | (Authenticating, Closed)
                | (Ready, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}
