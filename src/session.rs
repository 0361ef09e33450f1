use std::collections::BTreeMap;

use log::{debug, info, warn};

use crate::auth::TokenProvider;
use crate::connection::{ConnectionManager, Transition};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::Transport;
use crate::types::{ActiveAttachment, TerminalAttachment};

struct TerminalIntent {
    attachment: TerminalAttachment,
    /// True once the attach was emitted on the current link; cleared on
    /// every transition so each connect event gets exactly one emission.
    emitted: bool,
}

/// Turns "join this session" and "attach this terminal" into idempotent
/// intents that survive transport drops: the last join and every live
/// terminal attachment are re-emitted automatically after each reconnect,
/// with no caller involvement. From the caller's perspective, being joined
/// outlives any number of drops as long as the process does.
pub struct SessionProtocol<T: Transport> {
    manager: ConnectionManager<T>,
    tokens: Box<dyn TokenProvider>,
    active: Option<ActiveAttachment>,
    join_emitted: bool,
    terminals: BTreeMap<String, TerminalIntent>,
}

impl<T: Transport> SessionProtocol<T> {
    pub fn new(manager: ConnectionManager<T>, tokens: Box<dyn TokenProvider>) -> Self {
        Self { manager, tokens, active: None, join_emitted: false, terminals: BTreeMap::new() }
    }

    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ConnectionManager<T> {
        &mut self.manager
    }

    /// Record the join intent and emit it: immediately when connected,
    /// otherwise on the next connected transition. Repeating the same call
    /// never produces a second send on the same link.
    pub fn join_session(&mut self, session: &str, user: &str, token: Option<String>) {
        let intent = ActiveAttachment {
            session_id: session.to_string(),
            user_id: user.to_string(),
            auth_token: token,
        };
        let unchanged = self.active.as_ref() == Some(&intent);
        self.active = Some(intent);
        if !unchanged {
            self.join_emitted = false;
        }
        if self.manager.is_connected() && !self.join_emitted {
            self.emit_join();
        }
    }

    /// Leaves are sent unconditionally, even while disconnected (a dead link
    /// drops the frame and the server reconciles unknown leaves). The stored
    /// intent is cleared only when it still names this session, so a
    /// race-delayed leave cannot cancel a newer join.
    pub fn leave_session(&mut self, session: &str, user: &str) {
        self.send(&ClientMessage::SessionLeave {
            session_id: session.to_string(),
            user_id: user.to_string(),
        });
        if self.active.as_ref().map_or(false, |a| a.session_id == session) {
            self.active = None;
            self.join_emitted = false;
        }
    }

    /// Record a per-terminal attach intent, scoped by terminal id. Each
    /// terminal is replayed independently on reconnect.
    pub fn attach_terminal(&mut self, workspace: &str, terminal: &str, shell: &str) {
        let attachment = TerminalAttachment {
            workspace_id: workspace.to_string(),
            terminal_id: terminal.to_string(),
            shell: shell.to_string(),
        };
        let already_emitted = self
            .terminals
            .get(terminal)
            .map_or(false, |t| t.emitted && t.attachment == attachment);
        if self.manager.is_connected() && !already_emitted {
            self.emit_attach(&attachment);
            self.terminals.insert(terminal.to_string(), TerminalIntent { attachment, emitted: true });
        } else if !already_emitted {
            self.terminals.insert(terminal.to_string(), TerminalIntent { attachment, emitted: false });
        }
    }

    pub fn detach_terminal(&mut self, workspace: &str, terminal: &str) {
        self.terminals.remove(terminal);
        self.send(&ClientMessage::TerminalDetach {
            workspace_id: workspace.to_string(),
            terminal_id: terminal.to_string(),
        });
    }

    pub fn send_input(&mut self, workspace: &str, terminal: &str, data: &str) {
        self.send(&ClientMessage::TerminalInput {
            workspace_id: workspace.to_string(),
            terminal_id: terminal.to_string(),
            data: data.to_string(),
        });
    }

    pub fn resize_terminal(&mut self, workspace: &str, terminal: &str, rows: u16, cols: u16) {
        self.send(&ClientMessage::TerminalResize {
            workspace_id: workspace.to_string(),
            terminal_id: terminal.to_string(),
            rows,
            cols,
        });
    }

    pub fn active_attachment(&self) -> Option<&ActiveAttachment> {
        self.active.as_ref()
    }

    /// Drive the connection machine, replay intents on every transition to
    /// connected, and decode inbound frames. Undecodable frames are logged
    /// and skipped.
    pub fn pump(&mut self) -> Vec<ServerMessage> {
        let outcome = self.manager.pump();
        for transition in &outcome.transitions {
            match transition {
                Transition::Connected { reconnected } => self.replay(*reconnected),
                Transition::Disconnected | Transition::Failed => {
                    self.join_emitted = false;
                    for intent in self.terminals.values_mut() {
                        intent.emitted = false;
                    }
                }
                Transition::Reconnecting { .. } => {}
            }
        }
        let mut messages = Vec::new();
        for text in outcome.inbound {
            match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("skipping undecodable frame: {}", e),
            }
        }
        messages
    }

    /// The join goes out first, then the terminal attachments: the server
    /// expects transport up, then session membership, then terminals.
    fn replay(&mut self, reconnected: bool) {
        self.join_emitted = false;
        for intent in self.terminals.values_mut() {
            intent.emitted = false;
        }
        if self.active.is_some() {
            if reconnected {
                info!("replaying session join after reconnect");
            }
            self.emit_join();
        }
        let attachments: Vec<TerminalAttachment> =
            self.terminals.values().map(|t| t.attachment.clone()).collect();
        for attachment in attachments {
            self.emit_attach(&attachment);
            if let Some(intent) = self.terminals.get_mut(&attachment.terminal_id) {
                intent.emitted = true;
            }
        }
    }

    fn emit_join(&mut self) {
        let Some(intent) = self.active.clone() else { return };
        // A caller-pinned token is part of the tuple; otherwise a fresh one
        // is fetched for every emission.
        let token = intent.auth_token.clone().or_else(|| self.tokens.issue_token());
        let sent = self.send(&ClientMessage::SessionJoin {
            session_id: intent.session_id,
            user_id: intent.user_id,
            auth_token: token,
        });
        self.join_emitted = sent;
    }

    fn emit_attach(&mut self, attachment: &TerminalAttachment) {
        let token = self.tokens.issue_token().unwrap_or_default();
        self.send(&ClientMessage::TerminalAttach {
            workspace_id: attachment.workspace_id.clone(),
            terminal_id: attachment.terminal_id.clone(),
            auth_token: token,
            shell: attachment.shell.clone(),
        });
    }

    fn send(&mut self, msg: &ClientMessage) -> bool {
        let sent = self.manager.send(&msg.encode());
        if !sent {
            debug!("{} dropped while disconnected", msg.kind());
        }
        sent
    }

}

#[cfg(test)]
impl SessionProtocol<crate::transport::fake::FakeTransport> {
    pub fn sent(&mut self) -> &[String] {
        &self.manager.transport_mut().sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::transport::fake::FakeTransport;
    use crate::transport::TransportEvent;

    /// Hands out token-1, token-2, ... so replays are distinguishable.
    struct SeqTokens(u32);

    impl TokenProvider for SeqTokens {
        fn issue_token(&mut self) -> Option<String> {
            self.0 += 1;
            Some(format!("token-{}", self.0))
        }
    }

    struct NoTokens;

    impl TokenProvider for NoTokens {
        fn issue_token(&mut self) -> Option<String> {
            None
        }
    }

    fn protocol() -> SessionProtocol<FakeTransport> {
        SessionProtocol::new(ConnectionManager::new(FakeTransport::new()), Box::new(NoTokens))
    }

    fn protocol_with_tokens() -> SessionProtocol<FakeTransport> {
        SessionProtocol::new(ConnectionManager::new(FakeTransport::new()), Box::new(SeqTokens(0)))
    }

    fn go_online(p: &mut SessionProtocol<FakeTransport>) {
        p.manager_mut().transport_mut().push(TransportEvent::Connect);
        let _ = p.pump();
    }

    fn kinds(sent: &[String]) -> Vec<String> {
        sent.iter()
            .map(|s| serde_json::from_str::<serde_json::Value>(s).unwrap()["type"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn join_before_connect_is_deferred_then_sent_exactly_once() {
        let mut p = protocol();
        p.join_session("s1", "u1", None);
        assert!(p.sent().is_empty());
        p.manager_mut().connect();
        go_online(&mut p);
        let sent = p.sent().to_vec();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"type\":\"session_join\""));
        assert!(sent[0].contains("\"session_id\":\"s1\""));
        assert!(sent[0].contains("\"user_id\":\"u1\""));
        // Further pumps without transitions do not re-send.
        let _ = p.pump();
        assert_eq!(p.sent().len(), 1);
    }

    #[test]
    fn reconnect_replays_join_without_caller_involvement() {
        let mut p = protocol();
        p.join_session("s1", "u1", None);
        p.manager_mut().connect();
        go_online(&mut p);
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        let sent = p.sent().to_vec();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
    }

    #[test]
    fn duplicate_join_while_connected_sends_once() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.join_session("s1", "u1", None);
        p.join_session("s1", "u1", None);
        assert_eq!(p.sent().len(), 1);
    }

    #[test]
    fn changed_join_replaces_the_intent() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.join_session("s1", "u1", None);
        p.join_session("s2", "u1", None);
        let sent = p.sent().to_vec();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("\"session_id\":\"s2\""));
        assert_eq!(p.active_attachment().unwrap().session_id, "s2");
    }

    #[test]
    fn leave_is_sent_even_when_never_joined() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.leave_session("ghost", "u1");
        let sent = p.sent().to_vec();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("\"type\":\"session_leave\""));
    }

    #[test]
    fn stale_leave_does_not_cancel_newer_join() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.join_session("s2", "u1", None);
        p.leave_session("s1", "u1");
        assert_eq!(p.active_attachment().unwrap().session_id, "s2");
        // Leaving the joined session does clear it.
        p.leave_session("s2", "u1");
        assert!(p.active_attachment().is_none());
        // No join replay remains after the clear.
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        let sent = p.sent().to_vec();
        assert_eq!(kinds(&sent), vec!["session_join", "session_leave", "session_leave"]);
    }

    #[test]
    fn leave_while_disconnected_is_dropped_silently() {
        let mut p = protocol();
        p.join_session("s1", "u1", None);
        p.leave_session("s1", "u1");
        assert!(p.sent().is_empty());
        assert!(p.active_attachment().is_none());
        // Nothing to replay either.
        p.manager_mut().connect();
        go_online(&mut p);
        assert!(p.sent().is_empty());
    }

    #[test]
    fn terminals_attach_now_or_on_connect_and_replay_independently() {
        let mut p = protocol();
        p.attach_terminal("w1", "%1", "/bin/zsh");
        assert!(p.sent().is_empty());
        p.manager_mut().connect();
        go_online(&mut p);
        assert_eq!(kinds(&p.sent().to_vec()), vec!["terminal_attach"]);
        p.attach_terminal("w1", "%2", "/bin/zsh");
        assert_eq!(p.sent().len(), 2);
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        // Both terminals re-attached after the drop.
        let sent = p.sent().to_vec();
        assert_eq!(kinds(&sent), vec!["terminal_attach"; 4]);
        assert!(sent[2].contains("\"terminal_id\":\"%1\""));
        assert!(sent[3].contains("\"terminal_id\":\"%2\""));
    }

    #[test]
    fn duplicate_attach_while_connected_sends_once() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.attach_terminal("w1", "%1", "/bin/zsh");
        p.attach_terminal("w1", "%1", "/bin/zsh");
        assert_eq!(p.sent().len(), 1);
    }

    #[test]
    fn detached_terminal_is_not_replayed() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.attach_terminal("w1", "%1", "/bin/zsh");
        p.detach_terminal("w1", "%1");
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        assert_eq!(kinds(&p.sent().to_vec()), vec!["terminal_attach", "terminal_detach"]);
    }

    #[test]
    fn replay_sends_join_before_terminal_attaches() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.attach_terminal("w1", "%1", "/bin/zsh");
        p.join_session("s1", "u1", None);
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        let sent = p.sent().to_vec();
        assert_eq!(
            kinds(&sent),
            vec!["terminal_attach", "session_join", "session_join", "terminal_attach"]
        );
    }

    #[test]
    fn replayed_attach_fetches_a_fresh_token() {
        let mut p = protocol_with_tokens();
        p.manager_mut().connect();
        go_online(&mut p);
        p.attach_terminal("w1", "%1", "/bin/zsh");
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        let sent = p.sent().to_vec();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("\"auth_token\":\"token-1\""));
        assert!(sent[1].contains("\"auth_token\":\"token-2\""));
    }

    #[test]
    fn pinned_join_token_is_reused_verbatim() {
        let mut p = protocol_with_tokens();
        p.manager_mut().connect();
        go_online(&mut p);
        p.join_session("s1", "u1", Some("pinned".into()));
        p.manager_mut().transport_mut().push(TransportEvent::Disconnect { reason: "drop".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Reconnect);
        let _ = p.pump();
        for frame in p.sent().to_vec() {
            assert!(frame.contains("\"auth_token\":\"pinned\""));
        }
    }

    #[test]
    fn inbound_frames_decode_and_garbage_is_skipped() {
        let mut p = protocol();
        p.manager_mut().connect();
        go_online(&mut p);
        p.manager_mut().transport_mut().push(TransportEvent::Message {
            text: r#"{"type":"terminal_data","workspace_id":"s1","terminal_id":"%1","data":"hi"}"#.into(),
        });
        p.manager_mut().transport_mut().push(TransportEvent::Message { text: "not json".into() });
        p.manager_mut().transport_mut().push(TransportEvent::Message {
            text: r#"{"type":"terminal_error","error":"boom"}"#.into(),
        });
        let messages = p.pump();
        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], ServerMessage::TerminalData { data, .. } if data == "hi"));
        assert!(matches!(&messages[1], ServerMessage::TerminalError { error } if error == "boom"));
    }

    #[test]
    fn disconnect_preserves_the_join_intent() {
        let mut p = protocol();
        p.join_session("s1", "u1", None);
        p.manager_mut().connect();
        go_online(&mut p);
        p.manager_mut().disconnect();
        assert!(p.active_attachment().is_some());
        // A later connect picks the intent back up.
        p.manager_mut().connect();
        p.manager_mut().transport_mut().push(TransportEvent::Connect);
        let _ = p.pump();
        assert_eq!(kinds(&p.sent().to_vec()), vec!["session_join", "session_join"]);
    }
}
