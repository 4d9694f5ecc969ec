//! Broker session lifecycle
//!
//! `Idle -> Connecting -> Connected -> Disconnected`, with
//! `Connecting -> ConnectFailed` when the broker refuses the session. The session
//! handle is released on either terminal state so a later `connect` starts fresh.

use super::Transition;
use crate::broker::{
    BrokerError, BrokerEvent, BrokerSession, ConnectionParams, EventSink, SessionEvent,
    SessionFactory, SessionId,
};
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No session has been requested yet
    Idle,
    /// Session requested, waiting for the broker
    Connecting,
    /// Broker confirmed the session
    Connected,
    /// The session dropped and was released
    Disconnected,
    /// The broker refused the session; it was released
    ConnectFailed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::ConnectFailed => "connect-failed",
        };
        f.write_str(name)
    }
}

/// Side effects of a session transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Attach the queue consumer
    StartConsumer,
    /// Tell the queue consumer its session is gone
    InvalidateConsumer,
    /// Dispose the session handle and forget it
    ReleaseSession,
}

/// Pure session transition. `None` means the event does not apply in `state`.
pub fn next_connection_state(
    state: ConnectionState,
    event: &SessionEvent,
) -> Option<Transition<ConnectionState, ConnectionCommand>> {
    use ConnectionCommand::*;
    use ConnectionState::*;

    match (state, event) {
        (Connecting, SessionEvent::Up) => Some(Transition::with(Connected, vec![StartConsumer])),
        (Connecting, SessionEvent::ConnectFailed(_)) => {
            Some(Transition::with(ConnectFailed, vec![ReleaseSession]))
        }
        (Connected | Connecting, SessionEvent::Disconnected(_)) => Some(Transition::with(
            Disconnected,
            vec![InvalidateConsumer, ReleaseSession],
        )),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new session was created and asked to connect
    Requested(SessionId),
    /// The existing session is already up
    AlreadyConnected,
    /// A connection attempt is still pending
    InProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Teardown requested; completion arrives as a `Disconnected` notification
    Requested,
    /// There was no session to disconnect
    NotConnected,
}

/// Owns the broker session
pub struct ConnectionManager<F: SessionFactory> {
    factory: F,
    events: mpsc::UnboundedSender<BrokerEvent>,
    state: ConnectionState,
    session: Option<F::Session>,
    session_id: Option<SessionId>,
    next_session: u64,
}

impl<F: SessionFactory> ConnectionManager<F> {
    /// Notifications of every session this manager creates are sent to `events`
    pub fn new(factory: F, events: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self {
            factory,
            events,
            state: ConnectionState::Idle,
            session: None,
            session_id: None,
            next_session: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.session.is_some()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Whether `session` is the live session
    pub fn is_current(&self, session: SessionId) -> bool {
        self.session_id == Some(session)
    }

    /// The session, only while it is connected
    pub fn session(&self) -> Option<&F::Session> {
        if self.state == ConnectionState::Connected {
            self.session.as_ref()
        } else {
            None
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Create a session and ask it to connect.
    ///
    /// Returns once the request is issued; the outcome arrives as a notification.
    /// Synchronous failures are logged and returned with the state unchanged.
    pub fn connect(&mut self, params: &ConnectionParams) -> Result<ConnectOutcome, BrokerError> {
        if self.session.is_some() {
            return Ok(match self.state {
                ConnectionState::Connected => {
                    info!(
                        session = ?self.session_id,
                        "Already connected to broker at {}", params.url
                    );
                    ConnectOutcome::AlreadyConnected
                }
                state => {
                    info!(%state, "Connection attempt already in progress");
                    ConnectOutcome::InProgress
                }
            });
        }

        let id = SessionId(self.next_session);
        let _span = crate::broker_span!(operation = "session.connect", session = %id).entered();
        info!(
            url = %params.url,
            vpn = %params.vpn,
            username = %params.username,
            "Connecting to broker"
        );

        self.next_session += 1;
        let sink = EventSink::new(id, self.events.clone());

        let mut session = self.factory.create_session(params, sink).map_err(|e| {
            error!(
                state = %self.state,
                operation = "session.create",
                error = %e,
                "Failed to create broker session"
            );
            e
        })?;

        if let Err(e) = session.connect() {
            error!(
                state = %self.state,
                operation = "session.connect",
                error = %e,
                "Failed to request broker connection"
            );
            session.dispose();
            return Err(e);
        }

        self.session = Some(session);
        self.session_id = Some(id);
        self.state = ConnectionState::Connecting;
        debug!(session = %id, "Session created, waiting for broker confirmation");
        Ok(ConnectOutcome::Requested(id))
    }

    /// Request graceful teardown of the session.
    ///
    /// Stop the queue consumer first: the consumer must never be used on a session
    /// that has begun teardown.
    pub fn disconnect(&mut self) -> Result<DisconnectOutcome, BrokerError> {
        let state = self.state;
        match (state, self.session.as_mut()) {
            (ConnectionState::Connected | ConnectionState::Connecting, Some(session)) => {
                info!(%state, "Disconnecting from broker...");
                session.disconnect().map_err(|e| {
                    error!(
                        %state,
                        operation = "session.disconnect",
                        error = %e,
                        "Failed to request disconnect"
                    );
                    e
                })?;
                Ok(DisconnectOutcome::Requested)
            }
            _ => {
                info!(%state, "Not connected to broker");
                Ok(DisconnectOutcome::NotConnected)
            }
        }
    }

    /// Apply a session notification. Returns the commands the caller must run for
    /// the queue consumer; session release is handled here.
    pub fn handle_event(
        &mut self,
        session: SessionId,
        event: &SessionEvent,
    ) -> Vec<ConnectionCommand> {
        if !self.is_current(session) {
            debug!(%session, ?event, "Ignoring notification from released session");
            return Vec::new();
        }

        let Some(transition) = next_connection_state(self.state, event) else {
            warn!(state = %self.state, ?event, "Ignoring session notification");
            return Vec::new();
        };

        log_transition(self.state, transition.next, event);
        self.state = transition.next;

        let mut forwarded = Vec::with_capacity(transition.commands.len());
        for command in transition.commands {
            match command {
                ConnectionCommand::ReleaseSession => self.release_session(),
                other => forwarded.push(other),
            }
        }
        forwarded
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.dispose();
        }
        if let Some(id) = self.session_id.take() {
            debug!(session = %id, "Session released");
        }
    }
}

fn log_transition(from: ConnectionState, to: ConnectionState, event: &SessionEvent) {
    match (to, event) {
        (ConnectionState::Connected, _) => {
            info!(%from, %to, ">>> Connected to broker <<<");
        }
        (ConnectionState::ConnectFailed, SessionEvent::ConnectFailed(reason)) => {
            error!(
                %from,
                %to,
                "Connection to broker failed: {} - verify connection parameters and connectivity",
                reason
            );
        }
        (ConnectionState::Disconnected, SessionEvent::Disconnected(reason)) => {
            warn!(%from, %to, "Disconnected from broker: {}", reason);
        }
        _ => {
            info!("Broker session state: {} -> {}", from, to);
        }
    }
}
