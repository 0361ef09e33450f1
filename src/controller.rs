use std::collections::{HashMap, HashSet};

use log::{info, warn};

use crate::connection::ListenerToken;
use crate::layout::LayoutStore;
use crate::protocol::ServerMessage;
use crate::session::SessionProtocol;
use crate::transport::Transport;
use crate::types::{ActiveAttachment, ConnectionState, LayoutKind, NodeId, Tab, TabId};

/// Wire terminal id for a tab.
pub fn terminal_wire_id(tab: TabId) -> String {
    format!("%{}", tab)
}

fn route_key(workspace: &str, terminal: &str) -> String {
    format!("{}/{}", workspace, terminal)
}

/// Composition root: keeps the layout tree and the attachment protocol in
/// step. Every layout mutation that creates a tab attaches its terminal;
/// every mutation that removes tabs detaches theirs; inbound bytes are
/// routed to the tab that owns the terminal id.
pub struct PaneController<T: Transport> {
    protocol: SessionProtocol<T>,
    layouts: LayoutStore,
    /// Route keys (`workspace/terminal`) for every attached terminal.
    routes: HashSet<String>,
    outputs: HashMap<String, Vec<u8>>,
}

impl<T: Transport> PaneController<T> {
    pub fn new(protocol: SessionProtocol<T>, layouts: LayoutStore) -> Self {
        Self { protocol, layouts, routes: HashSet::new(), outputs: HashMap::new() }
    }

    pub fn connect(&mut self) {
        self.protocol.manager_mut().connect();
    }

    pub fn disconnect(&mut self) {
        self.protocol.manager_mut().disconnect();
    }

    pub fn reconnect(&mut self) {
        self.protocol.manager_mut().reconnect();
    }

    pub fn active_attachment(&self) -> Option<&ActiveAttachment> {
        self.protocol.active_attachment()
    }

    pub fn on_state_change(&mut self, listener: impl FnMut(&ConnectionState) + 'static) -> ListenerToken {
        self.protocol.manager_mut().on_state_change(listener)
    }

    pub fn unsubscribe(&mut self, token: ListenerToken) {
        self.protocol.manager_mut().unsubscribe(token);
    }

    pub fn layouts(&self) -> &LayoutStore {
        &self.layouts
    }

    /// Join the session and set up its initial single-pane layout, attaching
    /// the root tab's terminal. Rejoining an already-laid-out session only
    /// re-records the join intent.
    pub fn open_session(&mut self, session: &str, user: &str, token: Option<String>) {
        self.protocol.join_session(session, user, token);
        if let Some((_, tab)) = self.layouts.init_layout(session, None) {
            self.attach_tab(session, &tab);
        }
    }

    pub fn leave_session(&mut self, session: &str, user: &str) {
        self.protocol.leave_session(session, user);
    }

    pub fn split(&mut self, session: &str, pane: NodeId, kind: LayoutKind) -> Option<NodeId> {
        let out = self.layouts.split_pane(session, pane, kind)?;
        self.attach_tab(session, &out.tab);
        Some(out.pane)
    }

    pub fn add_tab(&mut self, session: &str, pane: NodeId) -> Option<TabId> {
        let tab = self.layouts.add_tab(session, pane)?;
        self.attach_tab(session, &tab);
        Some(tab.id)
    }

    pub fn close_tab(&mut self, session: &str, pane: NodeId, tab: TabId) {
        if let Some(out) = self.layouts.close_tab(session, pane, tab) {
            self.detach_tab(session, out.closed.id);
            if let Some(replacement) = out.replacement {
                self.attach_tab(session, &replacement);
            }
        }
    }

    pub fn close_pane(&mut self, session: &str, pane: NodeId) {
        if let Some(removed) = self.layouts.close_pane(session, pane) {
            for tab in &removed.tabs {
                self.detach_tab(session, tab.id);
            }
        }
    }

    pub fn resize_pane(&mut self, session: &str, pane: NodeId, new_size: i32) {
        self.layouts.resize_pane(session, pane, new_size);
    }

    pub fn focus_next_pane(&mut self, session: &str) {
        self.layouts.focus_next_pane(session);
    }

    pub fn focus_prev_pane(&mut self, session: &str) {
        self.layouts.focus_prev_pane(session);
    }

    pub fn select_tab(&mut self, session: &str, pane: NodeId, tab: TabId) {
        self.layouts.select_tab(session, pane, tab);
    }

    pub fn rename_tab(&mut self, session: &str, pane: NodeId, tab: TabId, name: &str) {
        self.layouts.rename_tab(session, pane, tab, name);
    }

    /// Forward input to the active pane's active tab.
    pub fn send_input(&mut self, session: &str, data: &str) {
        if let Some((_, tab)) = self.layouts.active_tab(session) {
            self.protocol.send_input(session, &terminal_wire_id(tab), data);
        }
    }

    /// Report a new size for the active tab's terminal.
    pub fn resize_terminal(&mut self, session: &str, rows: u16, cols: u16) {
        if let Some((_, tab)) = self.layouts.active_tab(session) {
            self.protocol.resize_terminal(session, &terminal_wire_id(tab), rows, cols);
        }
    }

    /// Drive the protocol and route inbound messages. Data frames land in
    /// the owning tab's output buffer; frames that name no terminal go to
    /// the workspace's active tab.
    pub fn pump(&mut self) {
        for msg in self.protocol.pump() {
            match msg {
                ServerMessage::TerminalData { workspace_id, terminal_id, data } => {
                    let key = match terminal_id {
                        Some(tid) => route_key(&workspace_id, &tid),
                        None => match self.layouts.active_tab(&workspace_id) {
                            Some((_, tab)) => route_key(&workspace_id, &terminal_wire_id(tab)),
                            None => {
                                warn!("data for unknown workspace {}", workspace_id);
                                continue;
                            }
                        },
                    };
                    if self.routes.contains(&key) {
                        self.outputs.entry(key).or_default().extend_from_slice(data.as_bytes());
                    } else {
                        warn!("data for unrouted terminal {}", key);
                    }
                }
                ServerMessage::TerminalReady { workspace_id, cwd } => {
                    info!("workspace {} ready (cwd {})", workspace_id, cwd);
                }
                ServerMessage::TerminalError { error } => {
                    warn!("terminal error: {}", error);
                }
            }
        }
    }

    /// Drain the buffered output for one tab.
    pub fn take_output(&mut self, session: &str, tab: TabId) -> Vec<u8> {
        self.outputs.remove(&route_key(session, &terminal_wire_id(tab))).unwrap_or_default()
    }

    /// One-line connection summary for a status display.
    pub fn status_line(&self) -> String {
        let state = self.protocol.manager().state();
        if state.connected {
            match self.protocol.manager().connected_since() {
                Some(t) => format!("connected since {}", t.format("%H:%M:%S")),
                None => "connected".to_string(),
            }
        } else if state.reconnecting {
            format!("reconnecting (attempt {})", state.reconnect_attempt)
        } else if let Some(error) = &state.error {
            format!("disconnected: {}", error)
        } else {
            "disconnected".to_string()
        }
    }

    fn attach_tab(&mut self, session: &str, tab: &Tab) {
        let tid = terminal_wire_id(tab.id);
        self.routes.insert(route_key(session, &tid));
        self.protocol.attach_terminal(session, &tid, &tab.shell_command);
    }

    fn detach_tab(&mut self, session: &str, tab: TabId) {
        let tid = terminal_wire_id(tab);
        self.routes.remove(&route_key(session, &tid));
        self.outputs.remove(&route_key(session, &tid));
        self.protocol.detach_terminal(session, &tid);
    }

    #[cfg(test)]
    fn protocol_mut(&mut self) -> &mut SessionProtocol<T> {
        &mut self.protocol
    }
}
