use std::collections::HashMap;

use crate::tree::*;
use crate::types::*;

/// Smallest and largest share a pane can be resized to, in percent. The
/// clamp keeps every pane visible and keeps any pane from swallowing its
/// whole split.
const MIN_PANE_PCT: i32 = 10;
const MAX_PANE_PCT: i32 = 90;

/// Layout state for one joined session: the node tree, the active pane, and
/// the monotonic counters backing node ids and `Terminal N` numbering.
/// Counter values are never reused, even across closes, so tab names stay
/// stable and non-colliding for the session's lifetime.
pub struct SessionLayout {
    pub root: Node,
    pub active_pane: NodeId,
    next_node_id: NodeId,
    next_terminal: usize,
}

/// Outcome of `close_tab`: the tab that left the pane, and the freshly
/// synthesized default tab when the closed one was the pane's last.
pub struct TabClose {
    pub closed: Tab,
    pub replacement: Option<Tab>,
}

/// Outcome of `split_pane`: the new pane and its initial tab.
pub struct PaneSplit {
    pub pane: NodeId,
    pub tab: Tab,
}

/// One layout tree per session, exclusively owned here. All operations are
/// synchronous in-memory mutations; invalid ids are no-ops rather than
/// errors so UI callers stay simple.
pub struct LayoutStore {
    layouts: HashMap<SessionId, SessionLayout>,
    default_shell: String,
}

impl LayoutStore {
    pub fn new(default_shell: impl Into<String>) -> Self {
        Self { layouts: HashMap::new(), default_shell: default_shell.into() }
    }

    /// Create the initial single-pane layout for a session. Idempotent: a
    /// second call for the same session changes nothing and returns None.
    /// Returns the root pane id and its first tab on creation.
    pub fn init_layout(&mut self, session: &str, shell: Option<&str>) -> Option<(NodeId, Tab)> {
        if self.layouts.contains_key(session) {
            return None;
        }
        let shell = shell.unwrap_or(&self.default_shell).to_string();
        let tab = Tab { id: 1, display_name: "Terminal 1".to_string(), shell_command: shell };
        let pane = Pane { id: 1, tabs: vec![tab.clone()], active_tab: tab.id, size: 100 };
        let layout = SessionLayout {
            root: Node::Pane(pane),
            active_pane: 1,
            next_node_id: 2,
            next_terminal: 2,
        };
        self.layouts.insert(session.to_string(), layout);
        Some((1, tab))
    }

    /// Append a freshly numbered tab to the target pane and make it active.
    pub fn add_tab(&mut self, session: &str, pane_id: NodeId) -> Option<Tab> {
        let shell = self.default_shell.clone();
        let layout = self.layouts.get_mut(session)?;
        find_pane(&layout.root, pane_id)?;
        let tab = alloc_tab(layout, &shell);
        let pane = find_pane_mut(&mut layout.root, pane_id)?;
        pane.active_tab = tab.id;
        pane.tabs.push(tab.clone());
        Some(tab)
    }

    /// Remove a tab from its pane. Closing the pane's last tab synthesizes a
    /// fresh default tab in its place (a pane is never empty). Closing the
    /// active tab activates the last tab in the remaining list.
    pub fn close_tab(&mut self, session: &str, pane_id: NodeId, tab_id: TabId) -> Option<TabClose> {
        let shell = self.default_shell.clone();
        let layout = self.layouts.get_mut(session)?;
        let pane = find_pane(&layout.root, pane_id)?;
        if !pane.tabs.iter().any(|t| t.id == tab_id) {
            return None;
        }
        let synthesized = if pane.tabs.len() == 1 { Some(alloc_tab(layout, &shell)) } else { None };
        let pane = find_pane_mut(&mut layout.root, pane_id)?;
        let idx = pane.tabs.iter().position(|t| t.id == tab_id)?;
        let closed = pane.tabs.remove(idx);
        let replacement = match synthesized {
            Some(tab) => {
                pane.active_tab = tab.id;
                pane.tabs.push(tab.clone());
                Some(tab)
            }
            None => {
                if pane.active_tab == tab_id {
                    // Deliberate tie-break: the last remaining tab becomes
                    // active, not the closed tab's previous neighbor.
                    if let Some(last) = pane.tabs.last() {
                        pane.active_tab = last.id;
                    }
                }
                None
            }
        };
        Some(TabClose { closed, replacement })
    }

    /// Replace the target pane with a two-child split: the original pane
    /// first, a brand-new single-tab pane second. The new pane becomes the
    /// session's active pane. Splitting the root pane replaces the root.
    pub fn split_pane(&mut self, session: &str, pane_id: NodeId, kind: LayoutKind) -> Option<PaneSplit> {
        let shell = self.default_shell.clone();
        let layout = self.layouts.get_mut(session)?;
        find_pane(&layout.root, pane_id)?;
        let tab = alloc_tab(layout, &shell);
        let split_id = layout.next_node_id;
        let new_pane_id = layout.next_node_id + 1;
        layout.next_node_id += 2;
        let second = Pane { id: new_pane_id, tabs: vec![tab.clone()], active_tab: tab.id, size: 50 };
        if !split_pane_node(&mut layout.root, pane_id, kind, split_id, second) {
            return None;
        }
        layout.active_pane = new_pane_id;
        Some(PaneSplit { pane: new_pane_id, tab })
    }

    /// Remove a pane from the tree. Refused (no-op) when the layout is a
    /// single root pane: a session always keeps at least one pane. When the
    /// closed pane was active, the first pane in depth-first order becomes
    /// active. Returns the removed pane with its tabs.
    pub fn close_pane(&mut self, session: &str, pane_id: NodeId) -> Option<Pane> {
        let layout = self.layouts.get_mut(session)?;
        if matches!(layout.root, Node::Pane(_)) {
            return None;
        }
        let removed = remove_pane_node(&mut layout.root, pane_id)?;
        if layout.active_pane == pane_id {
            if let Some(first) = first_pane_id(&layout.root) {
                layout.active_pane = first;
            }
        }
        Some(removed)
    }

    /// Set a pane's share of its parent, clamped to [10, 90] percent.
    pub fn resize_pane(&mut self, session: &str, pane_id: NodeId, new_size: i32) {
        let Some(layout) = self.layouts.get_mut(session) else { return };
        if let Some(pane) = find_pane_mut(&mut layout.root, pane_id) {
            pane.size = new_size.clamp(MIN_PANE_PCT, MAX_PANE_PCT) as u16;
        }
    }

    pub fn focus_next_pane(&mut self, session: &str) {
        self.cycle_focus(session, 1);
    }

    pub fn focus_prev_pane(&mut self, session: &str) {
        self.cycle_focus(session, -1);
    }

    fn cycle_focus(&mut self, session: &str, dir: isize) {
        let Some(layout) = self.layouts.get_mut(session) else { return };
        let ids = pane_ids(&layout.root);
        if ids.len() < 2 {
            return;
        }
        let cur = ids.iter().position(|&id| id == layout.active_pane).unwrap_or(0);
        let next = (cur as isize + dir).rem_euclid(ids.len() as isize) as usize;
        layout.active_pane = ids[next];
    }

    /// Make an existing tab the pane's active tab.
    pub fn select_tab(&mut self, session: &str, pane_id: NodeId, tab_id: TabId) {
        let Some(layout) = self.layouts.get_mut(session) else { return };
        if let Some(pane) = find_pane_mut(&mut layout.root, pane_id) {
            if pane.tabs.iter().any(|t| t.id == tab_id) {
                pane.active_tab = tab_id;
            }
        }
    }

    pub fn rename_tab(&mut self, session: &str, pane_id: NodeId, tab_id: TabId, name: &str) {
        let Some(layout) = self.layouts.get_mut(session) else { return };
        if let Some(pane) = find_pane_mut(&mut layout.root, pane_id) {
            if let Some(tab) = pane.tabs.iter_mut().find(|t| t.id == tab_id) {
                tab.display_name = name.to_string();
            }
        }
    }

    pub fn layout(&self, session: &str) -> Option<&Node> {
        self.layouts.get(session).map(|l| &l.root)
    }

    pub fn active_pane(&self, session: &str) -> Option<NodeId> {
        self.layouts.get(session).map(|l| l.active_pane)
    }

    /// The active pane's active tab, for input/resize targeting and for
    /// routing inbound data that names no terminal.
    pub fn active_tab(&self, session: &str) -> Option<(NodeId, TabId)> {
        let layout = self.layouts.get(session)?;
        let pane = find_pane(&layout.root, layout.active_pane)?;
        Some((pane.id, pane.active_tab))
    }

    /// JSON dump of a session's layout tree for diagnostics and tests.
    pub fn layout_json(&self, session: &str) -> Option<String> {
        let layout = self.layouts.get(session)?;
        serde_json::to_string(&layout.root).ok()
    }
}

fn alloc_tab(layout: &mut SessionLayout, shell: &str) -> Tab {
    let n = layout.next_terminal;
    layout.next_terminal += 1;
    Tab { id: n, display_name: format!("Terminal {}", n), shell_command: shell.to_string() }
}
