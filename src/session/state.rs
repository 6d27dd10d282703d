use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle state of a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Handshaking,
    Discovering,
    Ready,
    Degraded,
    Reconnecting,
    Closing,
    Closed,
}

impl SessionState {
    /// Only ready or degraded sessions accept invocations.
    pub fn accepts_invocations(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Degraded)
    }

    /// Whether the session has reached its terminal state.
    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, _) => false,
            (Closing, Closed) => true,
            (Closing, _) => false,
            (_, Closing) => true,

            (Disconnected, Connecting | Closed) => true,
            (Connecting, Handshaking | Reconnecting | Closed) => true,
            (Handshaking, Discovering | Reconnecting | Closed) => true,
            (Discovering, Ready | Reconnecting | Closed) => true,
            (Ready, Degraded | Reconnecting) => true,
            (Degraded, Ready | Reconnecting) => true,
            (Reconnecting, Connecting | Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Handshaking => "handshaking",
            SessionState::Discovering => "discovering",
            SessionState::Ready => "ready",
            SessionState::Degraded => "degraded",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Holds the current state and applies guarded transitions.
#[derive(Debug)]
pub(crate) struct StateCell {
    server_id: String,
    tx: watch::Sender<SessionState>,
}

impl StateCell {
    pub fn new(server_id: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            server_id: server_id.into(),
            tx,
        }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Applies `next` if legal from the current state. Illegal transitions
    /// are logged and leave the state untouched.
    pub fn transition(&self, next: SessionState) -> bool {
        self.transition_from(|_| true, next)
    }

    /// Applies `next` only when the current state satisfies `from` and the
    /// transition is legal.
    pub fn transition_from(&self, from: impl Fn(SessionState) -> bool, next: SessionState) -> bool {
        let server = &self.server_id;
        self.tx.send_if_modified(|state| {
            let current = *state;
            if !from(current) {
                return false;
            }
            if !current.can_transition_to(next) {
                warn!(server = %server, from = %current, to = %next, "Rejected illegal state transition");
                return false;
            }
            debug!(server = %server, from = %current, to = %next, "Session state changed");
            *state = next;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SessionState::*;
    use super::*;

    #[test]
    fn test_happy_path_is_legal() {
        let path = [Disconnected, Connecting, Handshaking, Discovering, Ready, Degraded, Ready, Closing, Closed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_reconnect_cycle_is_legal() {
        let path = [Ready, Reconnecting, Connecting, Reconnecting, Connecting, Handshaking, Discovering, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closing));
        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Closing.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Discovering));
        assert!(!Ready.can_transition_to(Closed));
    }

    #[test]
    fn test_cell_ignores_illegal_transition() {
        let cell = StateCell::new("s");
        assert!(!cell.transition(Ready));
        assert_eq!(cell.get(), Disconnected);
        assert!(cell.transition(Connecting));
        assert_eq!(cell.get(), Connecting);
    }

    #[test]
    fn test_conditional_transition() {
        let cell = StateCell::new("s");
        cell.transition(Connecting);
        assert!(!cell.transition_from(|s| s == Ready, Reconnecting));
        assert_eq!(cell.get(), Connecting);
        assert!(cell.transition_from(|s| s == Connecting, Reconnecting));
    }

    #[test]
    fn test_only_ready_and_degraded_accept_calls() {
        let accepting: Vec<_> = [Disconnected, Connecting, Handshaking, Discovering, Ready, Degraded, Reconnecting, Closing, Closed]
            .into_iter()
            .filter(|s| s.accepts_invocations())
            .collect();
        assert_eq!(accepting, vec![Ready, Degraded]);
    }
}
