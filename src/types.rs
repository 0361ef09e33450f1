use serde::{Serialize, Deserialize};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub type SessionId = String;
pub type NodeId = usize;
pub type TabId = usize;

/// One shell session inside a pane. Identity is fixed at creation;
/// `display_name` is user-renamable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub display_name: String,
    pub shell_command: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutKind { Horizontal, Vertical }

/// A rectangular region holding one or more tabs, one of them active.
/// Invariants: `tabs` is never empty; `active_tab` always names a tab in `tabs`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pane {
    pub id: NodeId,
    pub tabs: Vec<Tab>,
    pub active_tab: TabId,
    /// Percentage share of the immediate parent.
    pub size: u16,
}

/// An interior node dividing space between >=2 children along one axis.
/// A split reduced to a single child is replaced by that child.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub id: NodeId,
    pub kind: LayoutKind,
    pub children: Vec<Node>,
    pub size: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Pane(Pane),
    Split(Split),
}

/// Snapshot of the connection state machine. Every mutation builds a fresh
/// value; subscribers never observe a half-updated state.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionState {
    pub connected: bool,
    pub reconnecting: bool,
    pub reconnect_attempt: u32,
    pub error: Option<String>,
    pub disconnect_reason: Option<String>,
}

/// The most recent session-join intent. At most one per client; replayed
/// automatically after every reconnect.
#[derive(Clone, Debug, PartialEq)]
pub struct ActiveAttachment {
    pub session_id: String,
    pub user_id: String,
    pub auth_token: Option<String>,
}

/// One terminal-attach intent, keyed by terminal id and replayed
/// independently of the session join.
#[derive(Clone, Debug, PartialEq)]
pub struct TerminalAttachment {
    pub workspace_id: String,
    pub terminal_id: String,
    pub shell: String,
}
