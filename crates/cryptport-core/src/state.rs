// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Session state machine
//
//   Disconnected -> Connecting -> ConnectedUnauthenticated
//       -> Authenticating -> Authenticated
//
// Any state may drop back to Disconnected. Transfers never change the
// state; they are gated by it.

use crate::events::EventSink;
use crate::types::{SessionError, SessionEvent, SessionResult, SessionState};
use tokio::sync::watch;

/// Single source of truth for connection and authentication status
pub struct SessionStateMachine {
    tx: watch::Sender<SessionState>,
    events: EventSink,
}

impl SessionStateMachine {
    pub fn new(events: EventSink) -> Self {
        let (tx, _) = watch::channel(SessionState::Disconnected);
        Self { tx, events }
    }

    pub fn current(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Fail fast unless the session is authenticated
    pub fn require_authenticated(&self) -> SessionResult<()> {
        if self.current() == SessionState::Authenticated {
            Ok(())
        } else {
            Err(SessionError::NotAuthenticated)
        }
    }

    pub fn begin_connect(&self) -> SessionResult<()> {
        self.advance(SessionState::Disconnected, SessionState::Connecting)
            .map(|_| ())
    }

    pub fn connected(&self, reason: &str) -> SessionResult<()> {
        self.advance(SessionState::Connecting, SessionState::ConnectedUnauthenticated)?;
        self.events.emit(SessionEvent::ConnectionChanged {
            connected: true,
            reason: reason.to_string(),
        });
        Ok(())
    }

    pub fn begin_auth(&self) -> SessionResult<()> {
        self.advance(
            SessionState::ConnectedUnauthenticated,
            SessionState::Authenticating,
        )
        .map(|_| ())
    }

    pub fn authenticated(&self) -> SessionResult<()> {
        self.advance(SessionState::Authenticating, SessionState::Authenticated)
            .map(|_| ())
    }

    /// Move to Disconnected from anywhere. Returns false if already there.
    pub fn disconnected(&self, reason: &str) -> bool {
        let mut previous = SessionState::Disconnected;
        let changed = self.tx.send_if_modified(|state| {
            previous = *state;
            if *state == SessionState::Disconnected {
                false
            } else {
                *state = SessionState::Disconnected;
                true
            }
        });

        if changed {
            tracing::info!("Session {} -> disconnected: {}", previous, reason);
            self.events.emit(SessionEvent::StateChanged {
                state: SessionState::Disconnected,
            });
            self.events.emit(SessionEvent::ConnectionChanged {
                connected: false,
                reason: reason.to_string(),
            });
        }
        changed
    }

    /// Atomically move `from -> to`, rejecting any other starting state
    fn advance(&self, from: SessionState, to: SessionState) -> SessionResult<SessionState> {
        let mut observed = from;
        let changed = self.tx.send_if_modified(|state| {
            observed = *state;
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        });

        if !changed {
            return Err(Self::illegal(observed, to));
        }

        tracing::debug!("Session {} -> {}", from, to);
        self.events.emit(SessionEvent::StateChanged { state: to });
        Ok(to)
    }

    fn illegal(current: SessionState, wanted: SessionState) -> SessionError {
        match wanted {
            SessionState::Connecting => SessionError::Validation(format!(
                "Cannot connect while {}; disconnect first",
                current
            )),
            SessionState::Authenticating if current == SessionState::Authenticated => {
                SessionError::Validation("Connection is already authenticated".to_string())
            }
            SessionState::Authenticating => SessionError::Validation(format!(
                "Cannot authenticate while {}",
                current
            )),
            _ => SessionError::Validation(format!(
                "Illegal session transition {} -> {}",
                current, wanted
            )),
        }
    }
}
