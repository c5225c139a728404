//! # Link Connection State
//!
//! ```text
//! Idle -> Scanning -> Connecting -> Connected <-> Streaming
//!                                       |             |
//!                                       +-> Disconnecting -> Idle
//!
//! any non-Idle state -> Error -> Idle
//! ```

/// Connection state owned by the link manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected,
    Streaming,
    Disconnecting,
    Error,
}

impl LinkState {
    /// `connect()` may start a new attempt
    pub fn can_connect(self) -> bool {
        matches!(self, LinkState::Idle | LinkState::Error)
    }

    /// A discovery or connect attempt is running
    pub fn is_connecting(self) -> bool {
        matches!(self, LinkState::Scanning | LinkState::Connecting)
    }

    /// The transport is open
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Streaming)
    }

    /// Records are accepted
    pub fn is_streaming(self) -> bool {
        self == LinkState::Streaming
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;

        match (self, next) {
            (_, Error) => self != Idle && self != Error,
            (Idle, Scanning) | (Error, Scanning) => true,
            (Scanning, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Streaming) | (Streaming, Connected) => true,
            (Scanning, Disconnecting)
            | (Connecting, Disconnecting)
            | (Connected, Disconnecting)
            | (Streaming, Disconnecting) => true,
            (Disconnecting, Idle) | (Error, Idle) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Scanning => "scanning",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Streaming => "streaming",
            LinkState::Disconnecting => "disconnecting",
            LinkState::Error => "error",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LinkState::*;

    const ALL: [LinkState; 7] = [
        Idle,
        Scanning,
        Connecting,
        Connected,
        Streaming,
        Disconnecting,
        Error,
    ];

    #[test]
    fn test_default_is_idle() {
        assert_eq!(LinkState::default(), Idle);
    }

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Idle, Scanning, Connecting, Connected, Streaming, Connected, Disconnecting, Idle];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_error_reachable_from_every_non_idle_state() {
        for state in ALL {
            let expected = state != Idle && state != Error;
            assert_eq!(state.can_transition_to(Error), expected, "{} -> error", state);
        }
        assert!(Error.can_transition_to(Idle));
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Idle.can_transition_to(Connected));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Scanning.can_transition_to(Streaming));
        assert!(!Connected.can_transition_to(Idle));
    }

    #[test]
    fn test_connect_allowed_only_from_idle_or_error() {
        let allowed: Vec<_> = ALL.iter().filter(|s| s.can_connect()).collect();
        assert_eq!(allowed, vec![&Idle, &Error]);
    }

    #[test]
    fn test_predicates() {
        assert!(Scanning.is_connecting());
        assert!(Connecting.is_connecting());
        assert!(Connected.is_connected());
        assert!(Streaming.is_connected());
        assert!(Streaming.is_streaming());
        assert!(!Connected.is_streaming());
        assert!(!Idle.is_connected());
    }

    #[test]
    fn test_display() {
        assert_eq!(Streaming.to_string(), "streaming");
        assert_eq!(Error.to_string(), "error");
    }
}
