use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::transport::{Transport, TransportEvent};
use crate::types::ConnectionState;

/// Error string the machine settles on after the retry budget is spent.
pub const ERR_RECONNECT_EXHAUSTED: &str = "reconnection attempts exhausted";

/// A phase change observed during `pump`, consumed by the protocol layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// The transport came up (first connect or successful reconnect).
    Connected { reconnected: bool },
    Disconnected,
    Reconnecting { attempt: u32 },
    /// Terminal: retries exhausted, waiting for an explicit `reconnect()`.
    Failed,
}

pub struct PumpOutcome {
    pub transitions: Vec<Transition>,
    pub inbound: Vec<String>,
}

pub type ListenerToken = usize;

/// Owns one transport and translates its callbacks into a small connection
/// state machine. One instance, one machine; nothing global. Subscribers
/// are notified synchronously on every transition and failures surface
/// exclusively through state, never as errors from these operations.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    state: ConnectionState,
    subscribers: Vec<(ListenerToken, Box<dyn FnMut(&ConnectionState)>)>,
    next_token: ListenerToken,
    connected_since: Option<DateTime<Local>>,
    /// Set by `reconnect()`: the transport's own disconnect notification for
    /// the forced cycle is expected and not published as a state change.
    suppress_drop: bool,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::default(),
            subscribers: Vec::new(),
            next_token: 1,
            connected_since: None,
            suppress_drop: false,
        }
    }

    /// Idempotent: a no-op while connected.
    pub fn connect(&mut self) {
        if self.state.connected {
            return;
        }
        self.transport.open();
    }

    /// Unconditional teardown. Attachment intents are owned by the protocol
    /// layer and survive, so a later `connect()` picks them back up.
    pub fn disconnect(&mut self) {
        self.transport.close();
        if self.state.connected || self.state.reconnecting {
            self.connected_since = None;
            self.set_state(ConnectionState {
                connected: false,
                reconnecting: false,
                reconnect_attempt: 0,
                error: self.state.error.clone(),
                disconnect_reason: Some("client disconnect".to_string()),
            });
        }
    }

    /// Force a disconnect+connect cycle now, independent of any backoff
    /// timer the transport is sleeping out. The reconnecting state with the
    /// attempt counter reset to 1 is published before the cycle starts.
    pub fn reconnect(&mut self) {
        self.suppress_drop = true;
        self.set_state(ConnectionState {
            connected: false,
            reconnecting: true,
            reconnect_attempt: 1,
            error: self.state.error.clone(),
            disconnect_reason: self.state.disconnect_reason.clone(),
        });
        self.transport.force_reconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn connected_since(&self) -> Option<DateTime<Local>> {
        self.connected_since
    }

    /// Register a state listener. It sees the current state synchronously
    /// before this returns, so a late subscriber never misses the present
    /// truth, then every subsequent transition.
    pub fn on_state_change(&mut self, mut listener: impl FnMut(&ConnectionState) + 'static) -> ListenerToken {
        let token = self.next_token;
        self.next_token += 1;
        listener(&self.state);
        self.subscribers.push((token, Box::new(listener)));
        token
    }

    pub fn unsubscribe(&mut self, token: ListenerToken) {
        self.subscribers.retain(|(t, _)| *t != token);
    }

    /// Best-effort outbound send; false means the message was dropped
    /// because the link is down.
    pub fn send(&mut self, text: &str) -> bool {
        self.transport.send(text)
    }

    /// Drain transport events into state transitions (fanning each one out
    /// to subscribers) and collect inbound frames for the protocol layer.
    pub fn pump(&mut self) -> PumpOutcome {
        let mut outcome = PumpOutcome { transitions: Vec::new(), inbound: Vec::new() };
        while let Some(event) = self.transport.poll_event() {
            match event {
                up @ (TransportEvent::Connect | TransportEvent::Reconnect) => {
                    let reconnected = matches!(up, TransportEvent::Reconnect);
                    info!("transport up{}", if reconnected { " (reconnect)" } else { "" });
                    self.connected_since = Some(Local::now());
                    self.suppress_drop = false;
                    self.set_state(ConnectionState {
                        connected: true,
                        reconnecting: false,
                        reconnect_attempt: 0,
                        error: None,
                        disconnect_reason: None,
                    });
                    outcome.transitions.push(Transition::Connected { reconnected });
                }
                TransportEvent::Disconnect { reason } => {
                    debug!("transport down: {}", reason);
                    self.connected_since = None;
                    let expected = std::mem::take(&mut self.suppress_drop);
                    if !expected && (self.state.connected || self.state.reconnecting) {
                        self.set_state(ConnectionState {
                            connected: false,
                            reconnecting: false,
                            reconnect_attempt: self.state.reconnect_attempt,
                            error: self.state.error.clone(),
                            disconnect_reason: Some(reason),
                        });
                    }
                    outcome.transitions.push(Transition::Disconnected);
                }
                TransportEvent::ReconnectAttempt { attempt } => {
                    debug!("reconnect attempt {}", attempt);
                    self.set_state(ConnectionState {
                        connected: false,
                        reconnecting: true,
                        reconnect_attempt: attempt,
                        error: self.state.error.clone(),
                        disconnect_reason: self.state.disconnect_reason.clone(),
                    });
                    outcome.transitions.push(Transition::Reconnecting { attempt });
                }
                TransportEvent::Error { error } => {
                    warn!("transport error: {}", error);
                    self.set_state(ConnectionState {
                        connected: false,
                        reconnecting: self.state.reconnecting,
                        reconnect_attempt: self.state.reconnect_attempt,
                        error: Some(error),
                        disconnect_reason: self.state.disconnect_reason.clone(),
                    });
                }
                TransportEvent::ReconnectFailed { error } => {
                    warn!("reconnection exhausted: {}", error);
                    self.set_state(ConnectionState {
                        connected: false,
                        reconnecting: false,
                        reconnect_attempt: self.state.reconnect_attempt,
                        error: Some(ERR_RECONNECT_EXHAUSTED.to_string()),
                        disconnect_reason: self.state.disconnect_reason.clone(),
                    });
                    outcome.transitions.push(Transition::Failed);
                }
                TransportEvent::Message { text } => outcome.inbound.push(text),
            }
        }
        outcome
    }

    fn set_state(&mut self, next: ConnectionState) {
        self.state = next;
        for (_, listener) in self.subscribers.iter_mut() {
            listener(&self.state);
        }
    }

    #[cfg(test)]
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
